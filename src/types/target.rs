//! Target options: the per-target instance shape carried as a JSON blob on
//! every request, plus the manifest that documents its fields.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

pub const CREDENTIAL_FILE_ENV: &str = "GCP_CREDENTIAL_FILE";
pub const PROJECT_ID_ENV: &str = "GCP_PROJECT_ID";

pub const DEFAULT_ZONE: &str = "us-central1-a";
pub const DEFAULT_MACHINE_TYPE: &str = "n1-standard-1";
pub const DEFAULT_DISK_TYPE: &str = "pd-standard";
pub const DEFAULT_DISK_SIZE_GB: u32 = 20;
pub const DEFAULT_VM_IMAGE: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-2204-lts";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOptions {
    #[serde(rename = "Credential File", default)]
    pub credential_file: String,
    #[serde(rename = "Project Id", alias = "PROJECT Id", default)]
    pub project_id: String,
    #[serde(rename = "Zone", default)]
    pub zone: String,
    #[serde(rename = "Machine Type", default)]
    pub machine_type: String,
    #[serde(rename = "Disk Type", default)]
    pub disk_type: String,
    #[serde(rename = "Disk Size", default)]
    pub disk_size: u32,
    #[serde(rename = "VM Image", default)]
    pub vm_image: String,
}

impl TargetOptions {
    /// Parse target options, falling back to `lookup` for the credential file
    /// and project id.
    pub fn parse_with_env<F>(options_json: &str, lookup: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options: TargetOptions = serde_json::from_str(options_json)
            .map_err(|e| ProviderError::InvalidTargetOptions(e.to_string()))?;

        if options.credential_file.is_empty() {
            if let Some(path) = lookup(CREDENTIAL_FILE_ENV) {
                options.credential_file = path;
            }
        }
        if options.project_id.is_empty() {
            if let Some(project_id) = lookup(PROJECT_ID_ENV) {
                options.project_id = project_id;
            }
        }

        if options.credential_file.is_empty() {
            return Err(ProviderError::MissingCredentialFile);
        }
        if options.project_id.is_empty() {
            return Err(ProviderError::MissingProjectId);
        }

        Ok(options)
    }

    /// Credential path with a leading `~/` expanded to the home directory.
    pub fn credential_path(&self) -> PathBuf {
        match self.credential_file.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.credential_file)),
            None => PathBuf::from(&self.credential_file),
        }
    }
}

// ── Manifest ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetPropertyType {
    String,
    Int,
    FilePath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProperty {
    #[serde(rename = "type")]
    pub kind: TargetPropertyType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub input_masked: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

pub type TargetManifest = BTreeMap<String, TargetProperty>;

const ZONES: &[&str] = &[
    "us-central1-a",
    "us-central1-b",
    "us-central1-c",
    "us-east1-b",
    "us-east1-c",
    "us-east4-a",
    "us-west1-a",
    "us-west1-b",
    "europe-west1-b",
    "europe-west2-a",
    "europe-west3-a",
    "europe-west4-a",
    "asia-east1-a",
    "asia-northeast1-a",
    "asia-south1-a",
    "asia-southeast1-a",
    "australia-southeast1-a",
    "southamerica-east1-a",
];

const MACHINE_TYPES: &[&str] = &[
    "e2-micro",
    "e2-small",
    "e2-medium",
    "e2-standard-2",
    "e2-standard-4",
    "e2-standard-8",
    "n1-standard-1",
    "n1-standard-2",
    "n1-standard-4",
    "n1-standard-8",
    "n2-standard-2",
    "n2-standard-4",
    "n2-standard-8",
    "c2-standard-4",
    "c2-standard-8",
];

const DISK_TYPES: &[&str] = &["pd-standard", "pd-balanced", "pd-ssd", "pd-extreme"];

const VM_IMAGES: &[&str] = &[
    "projects/ubuntu-os-cloud/global/images/family/ubuntu-2204-lts",
    "projects/ubuntu-os-cloud/global/images/family/ubuntu-2404-lts-amd64",
    "projects/debian-cloud/global/images/family/debian-12",
    "projects/debian-cloud/global/images/family/debian-11",
];

fn suggestions(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Describe every target option field for the host's target editor.
pub fn target_manifest() -> TargetManifest {
    let mut manifest = TargetManifest::new();

    manifest.insert(
        "Credential File".into(),
        TargetProperty {
            kind: TargetPropertyType::FilePath,
            description: format!(
                "Full path to the GCP service account JSON key file.\n\
                 Leave blank if you've set the {CREDENTIAL_FILE_ENV} environment variable.\n\
                 Ensure that the file is secure and accessible only to authorized users."
            ),
            default_value: Some("~/.config/gcloud".into()),
            input_masked: false,
            suggestions: Vec::new(),
        },
    );
    manifest.insert(
        "Project Id".into(),
        TargetProperty {
            kind: TargetPropertyType::String,
            description: format!(
                "The GCP project ID where the resources will be created.\n\
                 Leave blank if you've set the {PROJECT_ID_ENV} environment variable.\n\
                 How to locate the project ID:\nhttps://support.google.com/googleapi/answer/7014113?hl=en"
            ),
            default_value: None,
            input_masked: true,
            suggestions: Vec::new(),
        },
    );
    manifest.insert(
        "Zone".into(),
        TargetProperty {
            kind: TargetPropertyType::String,
            description: "The GCP zone where the resources will be created.\n\
                          https://cloud.google.com/compute/docs/regions-zones\n\
                          List available zones with:\ngcloud compute zones list"
                .into(),
            default_value: Some(DEFAULT_ZONE.into()),
            input_masked: false,
            suggestions: suggestions(ZONES),
        },
    );
    manifest.insert(
        "Machine Type".into(),
        TargetProperty {
            kind: TargetPropertyType::String,
            description: "The GCP machine type to use for the VM.\n\
                          https://cloud.google.com/compute/docs/general-purpose-machines\n\
                          List available machine types with:\ngcloud compute machine-types list"
                .into(),
            default_value: Some(DEFAULT_MACHINE_TYPE.into()),
            input_masked: false,
            suggestions: suggestions(MACHINE_TYPES),
        },
    );
    manifest.insert(
        "Disk Type".into(),
        TargetProperty {
            kind: TargetPropertyType::String,
            description: "The GCP disk type to use for the VM.\n\
                          https://cloud.google.com/compute/docs/disks\n\
                          List available disk types with:\ngcloud compute disk-types list"
                .into(),
            default_value: Some(DEFAULT_DISK_TYPE.into()),
            input_masked: false,
            suggestions: suggestions(DISK_TYPES),
        },
    );
    manifest.insert(
        "Disk Size".into(),
        TargetProperty {
            kind: TargetPropertyType::Int,
            description: "The size of the instance volume, in GB.".into(),
            default_value: Some(DEFAULT_DISK_SIZE_GB.to_string()),
            input_masked: false,
            suggestions: Vec::new(),
        },
    );
    manifest.insert(
        "VM Image".into(),
        TargetProperty {
            kind: TargetPropertyType::String,
            description: "The GCP image to use for the VM.\n\
                          https://cloud.google.com/compute/docs/images\n\
                          List available images with:\ngcloud compute images list"
                .into(),
            default_value: Some(DEFAULT_VM_IMAGE.into()),
            input_masked: false,
            suggestions: suggestions(VM_IMAGES),
        },
    );

    manifest
}
