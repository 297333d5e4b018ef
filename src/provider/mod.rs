//! Entry points for the host orchestrator.
//!
//! `GcpProvider` holds no configuration until `initialize` is called; every
//! lifecycle call made before then fails with
//! [`ProviderError::NotInitialized`] without touching the network.
//! Initialization builds an immutable [`ProviderConfig`] and a fresh
//! [`WorkspaceOrchestrator`] that owns the tunnel for its lifetime.

pub mod orchestrator;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::compute::{ComputeProvider, GceClient};
use crate::error::ProviderError;
use crate::runtime::{DockerRuntimeFactory, RuntimeClientFactory};
use crate::session::{SessionConnector, SshSessionConnector};
use crate::tunnel::{DialWaitPolicy, TunnelConnector, UserspaceMeshConnector};
use crate::types::{
    InitializeRequest, ProjectInfo, ProjectRequest, ProviderInfo, ProviderTarget, TargetManifest,
    WorkspaceInfo, WorkspaceRequest, target_manifest,
};

pub use orchestrator::WorkspaceOrchestrator;

pub const PROVIDER_NAME: &str = "gcp-provider";

/// Environment lookup used for target option fallbacks.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

fn process_env() -> EnvLookup {
    Arc::new(|key: &str| std::env::var(key).ok())
}

/// Settings applied by `initialize`. Never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub base_path: PathBuf,
    pub download_url: String,
    pub agent_version: String,
    pub server_url: String,
    pub network_key: String,
    pub api_url: String,
    pub api_port: u32,
    pub server_port: u32,
    pub logs_dir: Option<PathBuf>,
}

impl ProviderConfig {
    pub fn from_request(req: InitializeRequest) -> Self {
        let base_path = if req.base_path.is_empty() {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("gcp-workspace-provider")
        } else {
            PathBuf::from(req.base_path)
        };
        Self {
            base_path,
            download_url: req.download_url,
            agent_version: req.agent_version,
            server_url: req.server_url,
            network_key: req.network_key,
            api_url: req.api_url,
            api_port: req.api_port,
            server_port: req.server_port,
            logs_dir: req.logs_dir.filter(|d| !d.is_empty()).map(PathBuf::from),
        }
    }
}

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub compute: Arc<dyn ComputeProvider>,
    pub connector: Arc<dyn TunnelConnector>,
    pub runtimes: Arc<dyn RuntimeClientFactory>,
    pub sessions: Arc<dyn SessionConnector>,
    pub dial_policy: DialWaitPolicy,
}

impl Collaborators {
    /// Compute Engine, userspace mesh, Docker Engine and system `ssh`.
    pub fn production(http: reqwest::Client) -> Self {
        Self {
            compute: Arc::new(GceClient::new(http)),
            connector: Arc::new(UserspaceMeshConnector::default()),
            runtimes: Arc::new(DockerRuntimeFactory),
            sessions: Arc::new(SshSessionConnector::default()),
            dial_policy: DialWaitPolicy::default(),
        }
    }
}

pub struct GcpProvider {
    collaborators: Collaborators,
    env: EnvLookup,
    orchestrator: RwLock<Option<Arc<WorkspaceOrchestrator>>>,
}

impl GcpProvider {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            env: process_env(),
            orchestrator: RwLock::new(None),
        }
    }

    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    /// Apply configuration. A repeated call replaces the orchestrator, and
    /// with it the tunnel; operations already running keep the old one.
    pub async fn initialize(&self, req: InitializeRequest) -> Result<(), ProviderError> {
        let config = ProviderConfig::from_request(req);
        tracing::info!(
            base_path = %config.base_path.display(),
            server_url = %config.server_url,
            agent_version = %config.agent_version,
            logs_dir = ?config.logs_dir,
            "provider initialized"
        );
        let orchestrator = Arc::new(WorkspaceOrchestrator::new(
            config,
            self.collaborators.clone(),
            self.env.clone(),
        ));
        *self.orchestrator.write().await = Some(orchestrator);
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.orchestrator.read().await.is_some()
    }

    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: PROVIDER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn target_manifest(&self) -> TargetManifest {
        target_manifest()
    }

    pub fn default_targets(&self) -> Vec<ProviderTarget> {
        Vec::new()
    }

    /// Cancel dial-waits in flight on the current orchestrator.
    pub async fn shutdown(&self) {
        if let Some(orchestrator) = self.orchestrator.read().await.as_ref() {
            orchestrator.shutdown();
        }
    }

    async fn orchestrator(&self) -> Result<Arc<WorkspaceOrchestrator>, ProviderError> {
        self.orchestrator
            .read()
            .await
            .clone()
            .ok_or(ProviderError::NotInitialized)
    }

    pub async fn create_workspace(&self, req: &WorkspaceRequest) -> Result<(), ProviderError> {
        self.orchestrator().await?.create_workspace(req).await
    }

    pub async fn start_workspace(&self, req: &WorkspaceRequest) -> Result<(), ProviderError> {
        self.orchestrator().await?.start_workspace(req).await
    }

    pub async fn stop_workspace(&self, req: &WorkspaceRequest) -> Result<(), ProviderError> {
        self.orchestrator().await?.stop_workspace(req).await
    }

    pub async fn destroy_workspace(&self, req: &WorkspaceRequest) -> Result<(), ProviderError> {
        self.orchestrator().await?.destroy_workspace(req).await
    }

    pub async fn get_workspace_info(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo, ProviderError> {
        self.orchestrator().await?.get_workspace_info(req).await
    }

    pub async fn create_project(&self, req: &ProjectRequest) -> Result<(), ProviderError> {
        self.orchestrator().await?.create_project(req).await
    }

    pub async fn start_project(&self, req: &ProjectRequest) -> Result<(), ProviderError> {
        self.orchestrator().await?.start_project(req).await
    }

    pub async fn stop_project(&self, req: &ProjectRequest) -> Result<(), ProviderError> {
        self.orchestrator().await?.stop_project(req).await
    }

    pub async fn destroy_project(&self, req: &ProjectRequest) -> Result<(), ProviderError> {
        self.orchestrator().await?.destroy_project(req).await
    }

    pub async fn get_project_info(&self, req: &ProjectRequest) -> Result<ProjectInfo, ProviderError> {
        self.orchestrator().await?.get_project_info(req).await
    }
}
