//! Startup script rendered into instance metadata.
//!
//! Every interpolated value is validated and quoted. Shell values use the
//! single-quote idiom; values in the agent's systemd `EnvironmentFile` are
//! double-quoted with backslash escapes. Files are written through quoted
//! heredocs so nothing in them is expanded by the shell.

use std::collections::BTreeMap;

use crate::error::ProviderError;

pub const OPERATOR_USER: &str = "daytona";
pub const WORKSPACE_ROOT: &str = "/home/daytona";
pub const ENGINE_API_PORT: u16 = 2375;
pub const AGENT_SSH_PORT: u16 = 2222;

pub const AGENT_LOG_ENV: &str = "DAYTONA_AGENT_LOG_FILE_PATH";
const AGENT_LOG_PATH: &str = "/home/daytona/.daytona-agent.log";
const AGENT_ENV_FILE: &str = "/etc/daytona-agent.env";
const AGENT_UNIT_FILE: &str = "/etc/systemd/system/daytona-agent.service";

/// Builder for the workspace bootstrap script.
#[derive(Debug, Clone)]
pub struct BootstrapScript {
    download_url: String,
    api_key: String,
    env_vars: BTreeMap<String, String>,
}

impl BootstrapScript {
    pub fn new(download_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            download_url: download_url.into(),
            api_key: api_key.into(),
            env_vars: BTreeMap::new(),
        }
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(name.into(), value.into());
        self
    }

    pub fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (name, value) in vars {
            self.env_vars.insert(name.clone(), value.clone());
        }
        self
    }

    /// Render the script. Fails on any env var that cannot be safely embedded.
    pub fn render(&self) -> Result<String, ProviderError> {
        let mut env_vars = self.env_vars.clone();
        env_vars.insert(AGENT_LOG_ENV.to_string(), AGENT_LOG_PATH.to_string());
        for (name, value) in &env_vars {
            validate_env(name, value)?;
        }

        let mut script = String::with_capacity(4096);
        script.push_str("#!/bin/bash\n");
        script.push_str(&format!(
            "id -u {user} >/dev/null 2>&1 || useradd -m -d {root} {user}\n\n",
            user = OPERATOR_USER,
            root = WORKSPACE_ROOT,
        ));

        script.push_str("command -v docker >/dev/null 2>&1 || curl -fsSL https://get.docker.com | bash\n\n");

        script.push_str("mkdir -p /etc/docker\n");
        script.push_str("cat > /etc/docker/daemon.json <<'EOF'\n");
        script.push_str("{\n");
        script.push_str(&format!(
            "  \"hosts\": [\"unix:///var/run/docker.sock\", \"tcp://0.0.0.0:{ENGINE_API_PORT}\"]\n"
        ));
        script.push_str("}\nEOF\n\n");

        script.push_str("mkdir -p /etc/systemd/system/docker.service.d\n");
        script.push_str("cat > /etc/systemd/system/docker.service.d/override.conf <<'EOF'\n");
        script.push_str("[Service]\nExecStart=\nExecStart=/usr/bin/dockerd\nEOF\n\n");
        script.push_str("systemctl daemon-reload\nsystemctl restart docker\n\n");

        script.push_str(&format!("usermod -aG docker {OPERATOR_USER}\n"));
        script.push_str(&format!(
            "if grep -q sudo /etc/group; then\n  usermod -aG sudo,docker {u}\nelif grep -q wheel /etc/group; then\n  usermod -aG wheel,docker {u}\nfi\n",
            u = OPERATOR_USER
        ));
        script.push_str(&format!(
            "echo '{u} ALL=(ALL) NOPASSWD:ALL' > /etc/sudoers.d/91-{u}\n\n",
            u = OPERATOR_USER
        ));

        for (name, value) in &env_vars {
            script.push_str(&format!("export {name}={}\n", shell_escape(value)));
        }
        script.push('\n');

        script.push_str(&self.install_command());
        script.push_str("\n\n");

        script.push_str(&format!("cat > {AGENT_ENV_FILE} <<'EOF'\n"));
        for (name, value) in &env_vars {
            script.push_str(&format!("{name}={}\n", unit_quote(value)));
        }
        script.push_str("EOF\n");
        script.push_str(&format!("chmod 600 {AGENT_ENV_FILE}\n\n"));

        script.push_str(&format!("cat > {AGENT_UNIT_FILE} <<'EOF'\n"));
        script.push_str("[Unit]\nDescription=Daytona Agent Service\nAfter=network.target\n\n");
        script.push_str(&format!(
            "[Service]\nUser={OPERATOR_USER}\nEnvironmentFile={AGENT_ENV_FILE}\nExecStart=/usr/local/bin/daytona agent --host\nRestart=always\n\n"
        ));
        script.push_str("[Install]\nWantedBy=multi-user.target\nEOF\n");
        script.push_str("systemctl daemon-reload\n");
        script.push_str("systemctl enable daytona-agent.service\n");
        script.push_str("systemctl start daytona-agent.service\n");

        Ok(script)
    }

    /// Authenticated agent install. Both the header and the URL are quoted.
    fn install_command(&self) -> String {
        let header = format!("Authorization: Bearer {}", self.api_key);
        format!(
            "curl -sfL -H {} {} | bash",
            shell_escape(&header),
            shell_escape(&self.download_url)
        )
    }
}

fn validate_env(name: &str, value: &str) -> Result<(), ProviderError> {
    let mut chars = name.chars();
    let valid_name = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid_name {
        return Err(ProviderError::InvalidEnvVar(format!("invalid name {name:?}")));
    }
    if value.contains(['\n', '\r', '\0']) {
        return Err(ProviderError::InvalidEnvVar(format!(
            "value of {name} contains a line break or NUL"
        )));
    }
    Ok(())
}

/// Shell escaping using the single-quote-with-replacement idiom.
///
/// Values made only of safe characters pass through unchanged. Anything else
/// is wrapped in single quotes with embedded quotes replaced by `'\''`.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b'/') {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Double-quoted value for a systemd `EnvironmentFile`.
fn unit_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' | '\\' | '$' | '`' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}
