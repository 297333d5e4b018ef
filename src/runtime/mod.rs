//! Container runtime on a workspace host.
//!
//! A [`RuntimeClient`] is bound to one workspace and reaches its container
//! engine through the tunnel. Building a client performs no I/O; reachability
//! is established beforehand by the dial-wait step.

pub mod docker;

use std::sync::Arc;

use async_trait::async_trait;

use crate::compute::bootstrap::ENGINE_API_PORT;
use crate::error::ProviderError;
use crate::logs::LogSink;
use crate::session::RemoteSession;
use crate::tunnel::{Tunnel, TunnelManager};
use crate::types::{ContainerRegistry, GitProviderConfig, Project, ProjectInfo, Workspace};

pub use docker::DockerRuntimeClient;

/// Everything the runtime needs to materialize a project.
#[derive(Debug, Clone, Copy)]
pub struct CreateProjectOptions<'a> {
    pub project: &'a Project,
    pub project_dir: &'a str,
    pub container_registry: Option<&'a ContainerRegistry>,
    pub git_provider_config: Option<&'a GitProviderConfig>,
}

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn create_workspace(
        &self,
        workspace: &Workspace,
        workspace_dir: &str,
        log: &mut LogSink,
        session: &dyn RemoteSession,
    ) -> Result<(), ProviderError>;

    async fn create_project(
        &self,
        opts: &CreateProjectOptions<'_>,
        log: &mut LogSink,
        session: &dyn RemoteSession,
    ) -> Result<(), ProviderError>;

    async fn start_project(
        &self,
        opts: &CreateProjectOptions<'_>,
        download_url: &str,
        log: &mut LogSink,
        session: &dyn RemoteSession,
    ) -> Result<(), ProviderError>;

    async fn stop_project(&self, project: &Project, log: &mut LogSink) -> Result<(), ProviderError>;

    async fn destroy_project(
        &self,
        project: &Project,
        project_dir: &str,
        session: &dyn RemoteSession,
    ) -> Result<(), ProviderError>;

    async fn get_project_info(&self, project: &Project) -> Result<ProjectInfo, ProviderError>;
}

/// Wraps a tunnel into a runtime client for one workspace.
pub trait RuntimeClientFactory: Send + Sync {
    fn client(
        &self,
        tunnel: Arc<dyn Tunnel>,
        workspace_id: &str,
    ) -> Result<Arc<dyn RuntimeClient>, ProviderError>;
}

/// Builds [`DockerRuntimeClient`]s targeting the engine API port.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerRuntimeFactory;

impl RuntimeClientFactory for DockerRuntimeFactory {
    fn client(
        &self,
        tunnel: Arc<dyn Tunnel>,
        workspace_id: &str,
    ) -> Result<Arc<dyn RuntimeClient>, ProviderError> {
        Ok(Arc::new(DockerRuntimeClient::new(
            tunnel,
            workspace_id,
            ENGINE_API_PORT,
        )))
    }
}

/// Obtain the tunnel and bind a runtime client to `workspace_id`.
pub async fn runtime_client(
    tunnels: &TunnelManager,
    factory: &dyn RuntimeClientFactory,
    workspace_id: &str,
) -> Result<Arc<dyn RuntimeClient>, ProviderError> {
    let tunnel = tunnels.connection().await?;
    factory.client(tunnel, workspace_id)
}
