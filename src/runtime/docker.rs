//! Docker Engine API client over the tunnel.
//!
//! The engine listens on `<workspace>:<port>` inside the mesh. A
//! [`LoopbackBridge`] exposes it on 127.0.0.1 and `bollard` talks plain HTTP
//! to the bridge. The API version is negotiated once per client against
//! `GET /version`; if negotiation fails, the client keeps bollard's default.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::OnceCell;

use crate::compute::bootstrap::shell_escape;
use crate::error::ProviderError;
use crate::logs::LogSink;
use crate::session::RemoteSession;
use crate::tunnel::{LoopbackBridge, Tunnel};
use crate::types::{ContainerRegistry, GitProviderConfig, GitRepository, Project, ProjectInfo, Workspace};

use super::{CreateProjectOptions, RuntimeClient};

pub const WORKSPACE_LABEL: &str = "daytona.workspace.id";
pub const PROJECT_LABEL: &str = "daytona.project.name";
const API_KEY_ENV: &str = "DAYTONA_SERVER_API_KEY";

/// Per-request timeout handed to bollard, in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// A negotiated engine handle and the bridge it talks through.
struct Connection {
    docker: Docker,
    _bridge: LoopbackBridge,
}

pub struct DockerRuntimeClient {
    tunnel: Arc<dyn Tunnel>,
    host: String,
    port: u16,
    connection: OnceCell<Connection>,
}

impl DockerRuntimeClient {
    pub fn new(tunnel: Arc<dyn Tunnel>, host: impl Into<String>, port: u16) -> Self {
        Self {
            tunnel,
            host: host.into(),
            port,
            connection: OnceCell::new(),
        }
    }

    /// Engine handle, bridged and version-negotiated on first use.
    async fn docker(&self) -> Result<&Docker, ProviderError> {
        let connection = self
            .connection
            .get_or_try_init(|| self.connect())
            .await?;
        Ok(&connection.docker)
    }

    async fn connect(&self) -> Result<Connection, ProviderError> {
        let bridge = LoopbackBridge::start(self.tunnel.clone(), self.host.clone(), self.port)
            .await
            .map_err(|e| ProviderError::Runtime(format!("failed to bridge {}:{}: {e}", self.host, self.port)))?;

        let docker = Docker::connect_with_http(
            &format!("http://{}", bridge.addr()),
            REQUEST_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| ProviderError::Runtime(format!("failed to create engine client: {e}")))?;

        let docker = match docker.clone().negotiate_version().await {
            Ok(negotiated) => {
                tracing::debug!(host = %self.host, "negotiated engine API version");
                negotiated
            }
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "engine version negotiation failed, using client default");
                docker
            }
        };

        Ok(Connection {
            docker,
            _bridge: bridge,
        })
    }

    // ── Engine operations ───────────────────────────────────────────

    async fn pull_image(
        &self,
        image: &str,
        registry: Option<&ContainerRegistry>,
        log: &mut LogSink,
    ) -> Result<(), ProviderError> {
        let docker = self.docker().await?;
        let (name, tag) = split_image(image);
        let options = CreateImageOptions {
            from_image: name.to_string(),
            tag: tag.unwrap_or_default().to_string(),
            ..Default::default()
        };
        let credentials = registry
            .filter(|cr| registry_matches(image, &cr.server))
            .map(|cr| DockerCredentials {
                username: Some(cr.username.clone()),
                password: Some(cr.password.clone()),
                serveraddress: Some(cr.server.clone()),
                ..Default::default()
            });

        log.line(format!("Pulling image {image}"));
        let mut stream = docker.create_image(Some(options), None, credentials);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| engine_error(e, "image pull"))?;
            if let Some(error) = info.error {
                return Err(ProviderError::Runtime(format!("image pull failed: {error}")));
            }
            if info.progress.is_some() {
                continue;
            }
            match (info.id, info.status) {
                (Some(id), Some(status)) => log.line(format!("{id}: {status}")),
                (None, Some(status)) => log.line(status),
                _ => {}
            }
        }

        log.line(format!("Image {image} pulled"));
        Ok(())
    }

    async fn create_container(&self, opts: &CreateProjectOptions<'_>) -> Result<(), ProviderError> {
        let docker = self.docker().await?;
        let project = opts.project;
        let name = project.container_name();
        let mount = format!("/workspaces/{}", project.name);
        let env: Vec<String> = project
            .env_vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let labels = HashMap::from([
            (WORKSPACE_LABEL.to_string(), project.workspace_id.clone()),
            (PROJECT_LABEL.to_string(), project.name.clone()),
        ]);

        let config = Config {
            image: Some(project.image.clone()),
            env: Some(env),
            entrypoint: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(mount.clone()),
            labels: Some(labels),
            user: Some(project.user.clone()).filter(|u| !u.is_empty()),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", opts.project_dir, mount)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let result = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if status_of(&e) == Some(409) => {
                tracing::info!(container = %name, "container already exists");
                Ok(())
            }
            Err(e) => Err(engine_error(e, "container create")),
        }
    }

    async fn start_container(&self, name: &str) -> Result<(), ProviderError> {
        let docker = self.docker().await?;
        match docker.start_container::<String>(name, None).await {
            Ok(()) => Ok(()),
            Err(e) if status_of(&e) == Some(304) => Ok(()),
            Err(e) => Err(engine_error(e, "container start")),
        }
    }

    /// Run `script` inside the container without waiting for it.
    async fn exec_detached(&self, container: &str, script: &str) -> Result<(), ProviderError> {
        let docker = self.docker().await?;
        let created = docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", script]),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| engine_error(e, "exec create"))?;

        docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| engine_error(e, "exec start"))?;
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntimeClient {
    async fn create_workspace(
        &self,
        workspace: &Workspace,
        workspace_dir: &str,
        log: &mut LogSink,
        session: &dyn RemoteSession,
    ) -> Result<(), ProviderError> {
        log.line(format!("Creating workspace {}", workspace.name));
        session
            .exec(&format!("mkdir -p {}", shell_escape(workspace_dir)))
            .await?;
        log.line("Workspace directory created");
        Ok(())
    }

    async fn create_project(
        &self,
        opts: &CreateProjectOptions<'_>,
        log: &mut LogSink,
        session: &dyn RemoteSession,
    ) -> Result<(), ProviderError> {
        let project = opts.project;
        tracing::info!(workspace_id = %project.workspace_id, project = %project.name, "creating project");

        session
            .exec(&format!("mkdir -p {}", shell_escape(opts.project_dir)))
            .await?;

        if let Some(repo) = &project.repository {
            log.line(format!("Cloning {}", repo.url));
            session
                .exec(&clone_command(repo, opts.project_dir, opts.git_provider_config))
                .await?;
        }

        self.pull_image(&project.image, opts.container_registry, log)
            .await?;
        self.create_container(opts).await?;

        log.line(format!("Project {} created", project.name));
        Ok(())
    }

    async fn start_project(
        &self,
        opts: &CreateProjectOptions<'_>,
        download_url: &str,
        log: &mut LogSink,
        session: &dyn RemoteSession,
    ) -> Result<(), ProviderError> {
        let name = opts.project.container_name();
        session
            .exec(&format!("mkdir -p {}", shell_escape(opts.project_dir)))
            .await?;

        log.line(format!("Starting project {}", opts.project.name));
        self.start_container(&name).await?;

        log.line("Starting agent");
        self.exec_detached(&name, &agent_command(download_url)).await?;

        log.line(format!("Project {} started", opts.project.name));
        Ok(())
    }

    async fn stop_project(&self, project: &Project, log: &mut LogSink) -> Result<(), ProviderError> {
        log.line(format!("Stopping project {}", project.name));
        let docker = self.docker().await?;
        match docker
            .stop_container(&project.container_name(), Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => {}
            Err(e) if status_of(&e) == Some(304) => {}
            Err(e) => return Err(engine_error(e, "container stop")),
        }
        log.line(format!("Project {} stopped", project.name));
        Ok(())
    }

    async fn destroy_project(
        &self,
        project: &Project,
        project_dir: &str,
        session: &dyn RemoteSession,
    ) -> Result<(), ProviderError> {
        let docker = self.docker().await?;
        let removed = docker
            .remove_container(
                &project.container_name(),
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;
        match removed {
            Ok(()) => {}
            Err(e) if status_of(&e) == Some(404) => {
                tracing::debug!(container = %project.container_name(), "container already gone");
            }
            Err(e) => return Err(engine_error(e, "container remove")),
        }

        session
            .exec(&format!("rm -rf {}", shell_escape(project_dir)))
            .await?;
        tracing::info!(workspace_id = %project.workspace_id, project = %project.name, "project destroyed");
        Ok(())
    }

    async fn get_project_info(&self, project: &Project) -> Result<ProjectInfo, ProviderError> {
        let docker = self.docker().await?;
        let inspect = match docker
            .inspect_container(&project.container_name(), None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if status_of(&e) == Some(404) => {
                return Ok(ProjectInfo {
                    name: project.name.clone(),
                    is_running: false,
                    created: String::new(),
                    provider_metadata: String::new(),
                });
            }
            Err(e) => return Err(engine_error(e, "container inspect")),
        };

        let metadata = json!({
            "containerId": inspect.id.unwrap_or_default(),
            "image": inspect.config.and_then(|c| c.image).unwrap_or_default(),
        });
        Ok(ProjectInfo {
            name: project.name.clone(),
            is_running: inspect.state.and_then(|s| s.running).unwrap_or(false),
            created: inspect.created.unwrap_or_default(),
            provider_metadata: metadata.to_string(),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn status_of(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn engine_error(err: bollard::errors::Error, what: &str) -> ProviderError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => ProviderError::NotFound(format!("{what}: {message}")),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => ProviderError::Runtime(format!("{what} returned {status_code}: {message}")),
        other => ProviderError::Runtime(format!("{what} failed: {other}")),
    }
}

/// Split an image reference into name and tag. Digest references carry no tag;
/// untagged references default to `latest`.
fn split_image(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(i) => (&image[..last_slash + i], Some(&image[last_slash + i + 1..])),
        None => (image, Some("latest")),
    }
}

fn registry_host(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => first,
        _ => "docker.io",
    }
}

fn registry_matches(image: &str, server: &str) -> bool {
    let server = server
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let server = server.split('/').next().unwrap_or(server);
    let host = registry_host(image);
    if host == "docker.io" {
        return matches!(server, "docker.io" | "index.docker.io" | "registry-1.docker.io");
    }
    host == server
}

fn clone_command(repo: &GitRepository, dir: &str, gpc: Option<&GitProviderConfig>) -> String {
    let mut cmd = String::from("git");
    if let Some(gpc) = gpc.filter(|g| !g.token.is_empty()) {
        let user = if gpc.username.is_empty() { "git" } else { gpc.username.as_str() };
        let creds = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{}", gpc.token));
        cmd.push_str(" -c ");
        cmd.push_str(&shell_escape(&format!("http.extraHeader=Authorization: Basic {creds}")));
    }
    cmd.push_str(" clone");
    if let Some(branch) = repo.branch.as_deref().filter(|b| !b.is_empty()) {
        cmd.push_str(" --branch ");
        cmd.push_str(&shell_escape(branch));
    }
    cmd.push(' ');
    cmd.push_str(&shell_escape(&repo.url));
    cmd.push(' ');
    cmd.push_str(&shell_escape(dir));

    format!("[ -d {} ] || {cmd}", shell_escape(&format!("{dir}/.git")))
}

fn agent_command(download_url: &str) -> String {
    format!(
        "curl -sfL -H \"Authorization: Bearer ${API_KEY_ENV}\" {} | bash && daytona agent",
        shell_escape(download_url)
    )
}
