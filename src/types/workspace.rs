use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One provisioned remote environment. Its remote existence is the cloud
/// instance named after `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Short-lived key the bootstrap script uses to fetch the agent.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub projects: Vec<Project>,
}

/// A container-based environment nested inside a workspace.
///
/// `workspace_id` is a lookup key only; the project never owns its workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub workspace_id: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub repository: Option<GitRepository>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

impl Project {
    /// Name of the container backing this project on the workspace runtime.
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.workspace_id, self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRegistry {
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitProviderConfig {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub token: String,
}

// ── Requests ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRequest {
    /// Serialized [`TargetOptions`](crate::types::TargetOptions) blob.
    pub target_options: String,
    pub workspace: Workspace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRequest {
    pub target_options: String,
    pub project: Project,
    #[serde(default)]
    pub container_registry: Option<ContainerRegistry>,
    #[serde(default)]
    pub git_provider_config: Option<GitProviderConfig>,
}

/// Values applied by the initialize call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    #[serde(default)]
    pub base_path: String,
    pub download_url: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub network_key: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_port: u32,
    #[serde(default)]
    pub server_port: u32,
    #[serde(default)]
    pub logs_dir: Option<String>,
}

// ── Responses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub name: String,
    /// JSON-encoded [`WorkspaceMetadata`](crate::types::WorkspaceMetadata).
    pub provider_metadata: String,
    #[serde(default)]
    pub projects: Vec<ProjectInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    pub is_running: bool,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub provider_metadata: String,
}

/// A preconfigured target offered to the host. This provider ships none.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTarget {
    pub name: String,
    pub options: String,
}
