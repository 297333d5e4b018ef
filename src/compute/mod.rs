//! Cloud compute collaborator.
//!
//! The orchestrator only needs instance CRUD; everything else about the cloud
//! stays behind [`ComputeProvider`].

pub mod bootstrap;
pub mod gce;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};

use crate::error::ProviderError;
use crate::logs::LogSink;
use crate::types::TargetOptions;

pub use bootstrap::BootstrapScript;
pub use gce::{AccessTokens, GceClient, ServiceAccountTokens};

/// What to create for a workspace.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub startup_script: String,
}

/// The subset of an instance description the provider reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cpu_platform: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub creation_timestamp: String,
    #[serde(default)]
    pub status: String,
}

/// Instance CRUD against the cloud. Long-running operations are awaited to
/// completion before returning.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn create_instance(
        &self,
        opts: &TargetOptions,
        spec: &InstanceSpec,
        log: &mut LogSink,
    ) -> Result<(), ProviderError>;

    async fn start_instance(&self, opts: &TargetOptions, name: &str) -> Result<(), ProviderError>;

    async fn stop_instance(&self, opts: &TargetOptions, name: &str) -> Result<(), ProviderError>;

    async fn delete_instance(&self, opts: &TargetOptions, name: &str) -> Result<(), ProviderError>;

    async fn get_instance(&self, opts: &TargetOptions, name: &str) -> Result<Instance, ProviderError>;
}

/// Cloud resource name for a workspace. Instance names must be lowercase.
pub fn instance_name(workspace_id: &str) -> String {
    format!("daytona-{}", workspace_id.to_lowercase())
}

/// The compute API encodes 64-bit ids as JSON strings.
fn u64_from_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_is_lowercase_and_prefixed() {
        assert_eq!(instance_name("AbC123"), "daytona-abc123");
    }

    #[test]
    fn instance_id_accepts_string_and_number() {
        let from_text: Instance =
            serde_json::from_str(r#"{"id": "18446744073709551615", "name": "vm"}"#).unwrap();
        assert_eq!(from_text.id, u64::MAX);

        let from_number: Instance = serde_json::from_str(r#"{"id": 42}"#).unwrap();
        assert_eq!(from_number.id, 42);
    }

    #[test]
    fn instance_reads_camel_case_fields() {
        let vm: Instance = serde_json::from_str(
            r#"{
                "id": "7",
                "name": "daytona-ws1",
                "cpuPlatform": "Intel Haswell",
                "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a",
                "creationTimestamp": "2024-01-01T00:00:00.000-08:00",
                "status": "RUNNING",
                "machineType": "ignored"
            }"#,
        )
        .unwrap();
        assert_eq!(vm.cpu_platform, "Intel Haswell");
        assert_eq!(vm.status, "RUNNING");
        assert_eq!(vm.creation_timestamp, "2024-01-01T00:00:00.000-08:00");
    }
}
