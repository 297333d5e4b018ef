//! SSH sessions over the tunnel.
//!
//! The system `ssh` client cannot dial through the mesh directly, so each
//! session runs a [`LoopbackBridge`] to `host:port`. A control master multiplexes all
//! commands of the session over one SSH connection.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::compute::bootstrap::{OPERATOR_USER, shell_escape};
use crate::error::ProviderError;
use crate::tunnel::{LoopbackBridge, Tunnel};

use super::{RemoteSession, SessionConnector};

#[derive(Debug, Clone)]
pub struct SshSessionConnector {
    pub ssh_bin: PathBuf,
    pub user: String,
    pub connect_timeout_secs: u32,
}

impl Default for SshSessionConnector {
    fn default() -> Self {
        Self {
            ssh_bin: PathBuf::from("ssh"),
            user: OPERATOR_USER.to_string(),
            connect_timeout_secs: 10,
        }
    }
}

#[async_trait]
impl SessionConnector for SshSessionConnector {
    async fn open(
        &self,
        tunnel: Arc<dyn Tunnel>,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn RemoteSession>, ProviderError> {
        let bridge = LoopbackBridge::start(tunnel, host.to_string(), port).await?;
        let control_path =
            std::env::temp_dir().join(format!("gcp-provider-ssh-{}.sock", uuid::Uuid::new_v4()));

        let session = SshSession {
            ssh_bin: self.ssh_bin.clone(),
            target: format!("{}@127.0.0.1", self.user),
            local_port: bridge.addr().port(),
            connect_timeout_secs: self.connect_timeout_secs,
            control_path,
            bridge,
            closed: AtomicBool::new(false),
        };

        let mut args = session.base_args();
        args.extend([
            "-o".into(),
            "ControlMaster=yes".into(),
            "-M".into(),
            "-N".into(),
            "-f".into(),
            session.target.clone(),
        ]);
        let output = tokio::process::Command::new(&session.ssh_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                session.bridge.stop();
                return Err(ProviderError::Session(format!("failed to run ssh: {e}")));
            }
        };
        if !output.status.success() {
            session.bridge.stop();
            return Err(ProviderError::Session(format!(
                "ssh to {host}:{port} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::debug!(host = %host, port, local_port = session.local_port, "ssh session open");
        Ok(Box::new(session))
    }
}

struct SshSession {
    ssh_bin: PathBuf,
    target: String,
    local_port: u16,
    connect_timeout_secs: u32,
    control_path: PathBuf,
    bridge: LoopbackBridge,
    closed: AtomicBool,
}

impl SshSession {
    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-p".into(),
            self.local_port.to_string(),
        ]
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<String, ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Session("session is closed".into()));
        }

        let mut args = self.base_args();
        args.push(self.target.clone());
        args.push("--".into());
        args.push("bash".into());
        args.push("-c".into());
        args.push(shell_escape(command));

        let output = tokio::process::Command::new(&self.ssh_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ProviderError::Session(format!("failed to run ssh: {e}")))?;

        if !output.status.success() {
            return Err(ProviderError::CommandFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut args = self.base_args();
        args.extend(["-O".into(), "exit".into(), self.target.clone()]);
        let result = tokio::process::Command::new(&self.ssh_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        self.bridge.stop();

        let output = result.map_err(|e| ProviderError::Session(format!("failed to run ssh: {e}")))?;
        if !output.status.success() {
            return Err(ProviderError::Session(format!(
                "closing ssh control master failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
