use std::sync::Arc;

use crate::provider::EnvLookup;
use crate::types::target::{CREDENTIAL_FILE_ENV, PROJECT_ID_ENV};

const DEFAULT_PORT: u16 = 8090;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    /// Service-account key file used when a target leaves it blank.
    pub gcp_credential_file: Option<String>,
    /// Project used when a target leaves it blank.
    pub gcp_project_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from an arbitrary variable lookup.
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Config {
            port: value("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            sentry_dsn: value("SENTRY_DSN"),
            environment: value("ENVIRONMENT").unwrap_or_else(|| "local".to_string()),
            gcp_credential_file: value(CREDENTIAL_FILE_ENV),
            gcp_project_id: value(PROJECT_ID_ENV),
        }
    }

    /// Fallbacks for target options, resolved from this config instead of
    /// the live process environment.
    pub fn target_defaults(&self) -> EnvLookup {
        let credential_file = self.gcp_credential_file.clone();
        let project_id = self.gcp_project_id.clone();
        Arc::new(move |key: &str| match key {
            CREDENTIAL_FILE_ENV => credential_file.clone(),
            PROJECT_ID_ENV => project_id.clone(),
            _ => None,
        })
    }
}
