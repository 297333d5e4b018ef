//! Workspace and project lifecycle.
//!
//! Instance state lives in the cloud, not here. Every operation opens its own
//! log sink, and every failure is written to that sink with a prefix naming
//! the phase before it is returned. Remote sessions are closed on every path
//! once opened.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::compute::bootstrap::{AGENT_SSH_PORT, WORKSPACE_ROOT};
use crate::compute::{BootstrapScript, InstanceSpec, instance_name};
use crate::error::ProviderError;
use crate::logs::{LogSink, LogSinkFactory};
use crate::runtime::{CreateProjectOptions, RuntimeClient, runtime_client};
use crate::session::{RemoteSession, close_quietly};
use crate::tunnel::{TunnelManager, wait_for_reachable};
use crate::types::{
    ProjectInfo, ProjectRequest, TargetOptions, WorkspaceInfo, WorkspaceMetadata, WorkspaceRequest,
};

use super::{Collaborators, EnvLookup, ProviderConfig};

const PARSE_FAILED: &str = "Failed to parse target options";
const CREATE_FAILED: &str = "Failed to create workspace";
const DIAL_FAILED: &str = "Failed to dial";
const CLIENT_FAILED: &str = "Failed to get docker client";
const SESSION_FAILED: &str = "Failed to create ssh client";

/// Record a phase failure on the operation's sink and hand the error back.
fn failed(log: &mut LogSink, phase: &str, err: ProviderError) -> ProviderError {
    log.line(format!("{phase}: {err}"));
    if err.is_configuration() {
        tracing::warn!(phase, error = %err, "lifecycle operation rejected");
    } else {
        tracing::error!(phase, error = %err, "lifecycle operation failed");
    }
    err
}

/// Directory on the workspace host holding all of its projects.
pub fn workspace_dir(workspace_id: &str) -> String {
    format!("{WORKSPACE_ROOT}/{workspace_id}")
}

pub fn project_dir(workspace_id: &str, project_name: &str) -> String {
    format!("{}/{workspace_id}-{project_name}", workspace_dir(workspace_id))
}

pub struct WorkspaceOrchestrator {
    config: ProviderConfig,
    collaborators: Collaborators,
    env: EnvLookup,
    tunnels: TunnelManager,
    logs: LogSinkFactory,
    cancel: CancellationToken,
}

impl WorkspaceOrchestrator {
    pub fn new(config: ProviderConfig, collaborators: Collaborators, env: EnvLookup) -> Self {
        let tunnels = TunnelManager::new(
            collaborators.connector.clone(),
            config.network_key.clone(),
            config.server_url.clone(),
            config.base_path.clone(),
        );
        let logs = LogSinkFactory::new(config.logs_dir.clone());
        Self {
            config,
            collaborators,
            env,
            tunnels,
            logs,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Abort any dial-wait in progress and make future ones fail fast.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn target_options(&self, options_json: &str) -> Result<TargetOptions, ProviderError> {
        TargetOptions::parse_with_env(options_json, |key| (*self.env)(key))
    }

    /// Wait until the workspace agent accepts connections through the tunnel.
    async fn wait_for_agent(&self, workspace_id: &str) -> Result<(), ProviderError> {
        let tunnel = self.tunnels.connection().await?;
        wait_for_reachable(
            tunnel.as_ref(),
            workspace_id,
            AGENT_SSH_PORT,
            self.collaborators.dial_policy,
            &self.cancel,
        )
        .await
    }

    async fn runtime(&self, workspace_id: &str) -> Result<Arc<dyn RuntimeClient>, ProviderError> {
        runtime_client(
            &self.tunnels,
            self.collaborators.runtimes.as_ref(),
            workspace_id,
        )
        .await
    }

    async fn open_session(&self, workspace_id: &str) -> Result<Box<dyn RemoteSession>, ProviderError> {
        let tunnel = self.tunnels.connection().await?;
        self.collaborators
            .sessions
            .open(tunnel, workspace_id, AGENT_SSH_PORT)
            .await
    }

    // ── Workspace operations ────────────────────────────────────────

    pub async fn create_workspace(&self, req: &WorkspaceRequest) -> Result<(), ProviderError> {
        let workspace = &req.workspace;
        let mut log = self.logs.workspace(&workspace.id);
        tracing::info!(workspace_id = %workspace.id, "creating workspace");

        let opts = self
            .target_options(&req.target_options)
            .map_err(|e| failed(&mut log, PARSE_FAILED, e))?;

        let startup_script = BootstrapScript::new(&self.config.download_url, &workspace.api_key)
            .envs(&workspace.env_vars)
            .render()
            .map_err(|e| failed(&mut log, CREATE_FAILED, e))?;
        let spec = InstanceSpec {
            name: instance_name(&workspace.id),
            startup_script,
        };
        let created = self
            .collaborators
            .compute
            .create_instance(&opts, &spec, &mut log)
            .await;
        created.map_err(|e| failed(&mut log, CREATE_FAILED, e))?;

        log.line("Waiting for the agent to start");
        self.wait_for_agent(&workspace.id)
            .await
            .map_err(|e| failed(&mut log, DIAL_FAILED, e))?;
        log.line("Agent started");

        let runtime = self
            .runtime(&workspace.id)
            .await
            .map_err(|e| failed(&mut log, CLIENT_FAILED, e))?;
        let session = self
            .open_session(&workspace.id)
            .await
            .map_err(|e| failed(&mut log, SESSION_FAILED, e))?;

        let result = runtime
            .create_workspace(workspace, &workspace_dir(&workspace.id), &mut log, session.as_ref())
            .await;
        close_quietly(session.as_ref()).await;
        result.map_err(|e| failed(&mut log, CREATE_FAILED, e))?;

        tracing::info!(workspace_id = %workspace.id, "workspace created");
        Ok(())
    }

    pub async fn start_workspace(&self, req: &WorkspaceRequest) -> Result<(), ProviderError> {
        let workspace = &req.workspace;
        let mut log = self.logs.workspace(&workspace.id);

        let opts = self
            .target_options(&req.target_options)
            .map_err(|e| failed(&mut log, PARSE_FAILED, e))?;

        self.wait_for_agent(&workspace.id)
            .await
            .map_err(|e| failed(&mut log, DIAL_FAILED, e))?;

        let started = self
            .collaborators
            .compute
            .start_instance(&opts, &instance_name(&workspace.id))
            .await;
        started.map_err(|e| failed(&mut log, "Failed to start workspace", e))
    }

    pub async fn stop_workspace(&self, req: &WorkspaceRequest) -> Result<(), ProviderError> {
        let workspace = &req.workspace;
        let mut log = self.logs.workspace(&workspace.id);

        let opts = self
            .target_options(&req.target_options)
            .map_err(|e| failed(&mut log, PARSE_FAILED, e))?;

        let stopped = self
            .collaborators
            .compute
            .stop_instance(&opts, &instance_name(&workspace.id))
            .await;
        stopped.map_err(|e| failed(&mut log, "Failed to stop workspace", e))
    }

    pub async fn destroy_workspace(&self, req: &WorkspaceRequest) -> Result<(), ProviderError> {
        let workspace = &req.workspace;
        let mut log = self.logs.workspace(&workspace.id);

        let opts = self
            .target_options(&req.target_options)
            .map_err(|e| failed(&mut log, PARSE_FAILED, e))?;

        let deleted = self
            .collaborators
            .compute
            .delete_instance(&opts, &instance_name(&workspace.id))
            .await;
        deleted.map_err(|e| failed(&mut log, "Failed to destroy workspace", e))
    }

    /// Instance metadata plus the info of every project, looked up in order.
    /// The first project failure aborts the whole call.
    pub async fn get_workspace_info(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo, ProviderError> {
        let mut info = self.instance_info(req).await?;

        for project in &req.workspace.projects {
            let project_info = self
                .get_project_info(&ProjectRequest {
                    target_options: req.target_options.clone(),
                    project: project.clone(),
                    container_registry: None,
                    git_provider_config: None,
                })
                .await?;
            info.projects.push(project_info);
        }

        Ok(info)
    }

    async fn instance_info(&self, req: &WorkspaceRequest) -> Result<WorkspaceInfo, ProviderError> {
        let workspace = &req.workspace;
        let mut log = self.logs.workspace(&workspace.id);

        let opts = self
            .target_options(&req.target_options)
            .map_err(|e| failed(&mut log, PARSE_FAILED, e))?;

        let instance = self
            .collaborators
            .compute
            .get_instance(&opts, &instance_name(&workspace.id))
            .await;
        let instance = instance.map_err(|e| failed(&mut log, "Failed to get workspace info", e))?;

        let metadata = WorkspaceMetadata::from(&instance);
        Ok(WorkspaceInfo {
            name: workspace.name.clone(),
            provider_metadata: serde_json::to_string(&metadata)?,
            projects: Vec::new(),
        })
    }

    // ── Project operations ──────────────────────────────────────────

    pub async fn create_project(&self, req: &ProjectRequest) -> Result<(), ProviderError> {
        let project = &req.project;
        let mut log = self.logs.project(&project.workspace_id, &project.name);
        tracing::info!(workspace_id = %project.workspace_id, project = %project.name, "creating project");

        let runtime = self
            .runtime(&project.workspace_id)
            .await
            .map_err(|e| failed(&mut log, CLIENT_FAILED, e))?;
        let session = self
            .open_session(&project.workspace_id)
            .await
            .map_err(|e| failed(&mut log, SESSION_FAILED, e))?;

        let dir = project_dir(&project.workspace_id, &project.name);
        let opts = CreateProjectOptions {
            project,
            project_dir: &dir,
            container_registry: req.container_registry.as_ref(),
            git_provider_config: req.git_provider_config.as_ref(),
        };
        let result = runtime.create_project(&opts, &mut log, session.as_ref()).await;
        close_quietly(session.as_ref()).await;
        result.map_err(|e| failed(&mut log, "Failed to create project", e))
    }

    pub async fn start_project(&self, req: &ProjectRequest) -> Result<(), ProviderError> {
        let project = &req.project;
        let mut log = self.logs.project(&project.workspace_id, &project.name);

        let runtime = self
            .runtime(&project.workspace_id)
            .await
            .map_err(|e| failed(&mut log, CLIENT_FAILED, e))?;
        let session = self
            .open_session(&project.workspace_id)
            .await
            .map_err(|e| failed(&mut log, SESSION_FAILED, e))?;

        let dir = project_dir(&project.workspace_id, &project.name);
        let opts = CreateProjectOptions {
            project,
            project_dir: &dir,
            container_registry: req.container_registry.as_ref(),
            git_provider_config: req.git_provider_config.as_ref(),
        };
        let result = runtime
            .start_project(&opts, &self.config.download_url, &mut log, session.as_ref())
            .await;
        close_quietly(session.as_ref()).await;
        result.map_err(|e| failed(&mut log, "Failed to start project", e))
    }

    pub async fn stop_project(&self, req: &ProjectRequest) -> Result<(), ProviderError> {
        let project = &req.project;
        let mut log = self.logs.project(&project.workspace_id, &project.name);

        let runtime = self
            .runtime(&project.workspace_id)
            .await
            .map_err(|e| failed(&mut log, CLIENT_FAILED, e))?;
        let stopped = runtime.stop_project(project, &mut log).await;
        stopped.map_err(|e| failed(&mut log, "Failed to stop project", e))
    }

    pub async fn destroy_project(&self, req: &ProjectRequest) -> Result<(), ProviderError> {
        let project = &req.project;
        let mut log = self.logs.project(&project.workspace_id, &project.name);

        let runtime = self
            .runtime(&project.workspace_id)
            .await
            .map_err(|e| failed(&mut log, CLIENT_FAILED, e))?;
        let session = self
            .open_session(&project.workspace_id)
            .await
            .map_err(|e| failed(&mut log, SESSION_FAILED, e))?;

        let dir = project_dir(&project.workspace_id, &project.name);
        let result = runtime.destroy_project(project, &dir, session.as_ref()).await;
        close_quietly(session.as_ref()).await;
        result.map_err(|e| failed(&mut log, "Failed to destroy project", e))
    }

    pub async fn get_project_info(&self, req: &ProjectRequest) -> Result<ProjectInfo, ProviderError> {
        let project = &req.project;
        let mut log = self.logs.project(&project.workspace_id, &project.name);

        let runtime = self
            .runtime(&project.workspace_id)
            .await
            .map_err(|e| failed(&mut log, CLIENT_FAILED, e))?;
        let info = runtime.get_project_info(project).await;
        info.map_err(|e| failed(&mut log, "Failed to get project info", e))
    }
}
