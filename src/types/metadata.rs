use serde::{Deserialize, Serialize};

use crate::compute::Instance;

/// Read-only snapshot of the cloud instance backing a workspace.
/// Recomputed on every info query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    pub virtual_machine_id: u64,
    pub virtual_machine_name: String,
    pub platform: String,
    pub location: String,
    pub created: String,
}

impl From<&Instance> for WorkspaceMetadata {
    fn from(vm: &Instance) -> Self {
        Self {
            virtual_machine_id: vm.id,
            virtual_machine_name: vm.name.clone(),
            platform: vm.cpu_platform.clone(),
            location: last_segment(&vm.zone).to_string(),
            created: vm.creation_timestamp.clone(),
        }
    }
}

/// Compute Engine reports zones as resource URLs; keep only the zone name.
fn last_segment(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}
