//! Compute Engine REST client.
//!
//! API: POST/GET/DELETE {base}/projects/{p}/zones/{z}/instances[/{name}[/start|/stop]]
//! Mutations return a zonal operation that is polled via
//! POST .../operations/{op}/wait until it reports DONE.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::ProviderError;
use crate::logs::LogSink;
use crate::types::TargetOptions;

use super::{ComputeProvider, Instance, InstanceSpec};

pub const DEFAULT_API_BASE: &str = "https://compute.googleapis.com/compute/v1";
pub const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute";

/// The wait endpoint holds the request open for up to two minutes, longer
/// than the shared client's timeout.
const OPERATION_WAIT_TIMEOUT: Duration = Duration::from_secs(180);

// ── Auth ────────────────────────────────────────────────────────────

/// Source of OAuth access tokens for the compute API.
#[async_trait]
pub trait AccessTokens: Send + Sync {
    async fn token(&self, credential_file: &Path) -> Result<String, ProviderError>;
}

/// Service-account key file tokens via `gcp_auth`. Each key file is parsed
/// once; the loaded account also caches its access tokens until expiry.
#[derive(Default)]
pub struct ServiceAccountTokens {
    accounts: AccountCache<gcp_auth::CustomServiceAccount>,
}

#[async_trait]
impl AccessTokens for ServiceAccountTokens {
    async fn token(&self, credential_file: &Path) -> Result<String, ProviderError> {
        use gcp_auth::TokenProvider;
        let sa = self.accounts.get_or_load(credential_file, |path| {
            gcp_auth::CustomServiceAccount::from_file(path).map_err(|e| {
                ProviderError::Compute(format!(
                    "failed to load service account key {}: {e}",
                    path.display()
                ))
            })
        })?;
        let token = sa
            .token(&[COMPUTE_SCOPE])
            .await
            .map_err(|e| ProviderError::Compute(format!("failed to get access token: {e}")))?;
        Ok(token.as_str().to_string())
    }
}

/// Loaded credentials keyed by key file path. Failed loads are not cached.
struct AccountCache<T> {
    loaded: Mutex<HashMap<PathBuf, Arc<T>>>,
}

impl<T> Default for AccountCache<T> {
    fn default() -> Self {
        Self {
            loaded: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> AccountCache<T> {
    fn get_or_load(
        &self,
        path: &Path,
        load: impl FnOnce(&Path) -> Result<T, ProviderError>,
    ) -> Result<Arc<T>, ProviderError> {
        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| ProviderError::Compute("service account cache poisoned".into()))?;
        if let Some(account) = loaded.get(path) {
            return Ok(account.clone());
        }
        let account = Arc::new(load(path)?);
        loaded.insert(path.to_path_buf(), account.clone());
        Ok(account)
    }
}

// ── Operations ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    http_error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OperationError {
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct OperationErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl Operation {
    fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    fn failure(&self) -> Option<ProviderError> {
        let error = self.error.as_ref()?;
        let mut message = error
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        if message.is_empty() {
            message = self
                .http_error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
        }
        Some(ProviderError::Operation {
            name: self.name.clone(),
            message,
        })
    }
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GceClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn AccessTokens>,
    poll_interval: Duration,
}

impl GceClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: DEFAULT_API_BASE.to_string(),
            tokens: Arc::new(ServiceAccountTokens::default()),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn AccessTokens>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn zone_url(&self, opts: &TargetOptions) -> String {
        format!(
            "{}/projects/{}/zones/{}",
            self.base_url, opts.project_id, opts.zone
        )
    }

    fn instance_url(&self, opts: &TargetOptions, name: &str) -> String {
        format!("{}/instances/{}", self.zone_url(opts), name)
    }

    async fn token(&self, opts: &TargetOptions) -> Result<String, ProviderError> {
        self.tokens.token(&opts.credential_path()).await
    }

    /// Send an authorized request and reject non-success statuses.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        token: &str,
        what: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProviderError::Compute(format!("{what} failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::NotFound(format!("{what}: {body}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Compute(format!("{what} returned {status}: {body}")));
        }
        Ok(resp)
    }

    /// Issue a mutation and wait for its operation to finish.
    async fn mutate(
        &self,
        opts: &TargetOptions,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<(), ProviderError> {
        let token = self.token(opts).await?;
        let resp = self.send(request, &token, what).await?;
        let operation = resp
            .json::<Operation>()
            .await
            .map_err(|e| ProviderError::Serde(format!("failed to parse {what} operation: {e}")))?;
        self.wait_operation(opts, &token, operation).await
    }

    async fn wait_operation(
        &self,
        opts: &TargetOptions,
        token: &str,
        mut operation: Operation,
    ) -> Result<(), ProviderError> {
        loop {
            if operation.is_done() {
                return match operation.failure() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }

            tracing::debug!(operation = %operation.name, status = %operation.status, "waiting for operation");
            tokio::time::sleep(self.poll_interval).await;

            let url = format!("{}/operations/{}/wait", self.zone_url(opts), operation.name);
            let request = self.http.post(&url).timeout(OPERATION_WAIT_TIMEOUT);
            let resp = self.send(request, token, "operation wait").await?;
            operation = resp.json::<Operation>().await.map_err(|e| {
                ProviderError::Serde(format!("failed to parse operation response: {e}"))
            })?;
        }
    }

    fn insert_body(opts: &TargetOptions, spec: &InstanceSpec) -> serde_json::Value {
        json!({
            "name": spec.name,
            "machineType": format!("zones/{}/machineTypes/{}", opts.zone, opts.machine_type),
            "disks": [{
                "autoDelete": true,
                "boot": true,
                "type": "PERSISTENT",
                "initializeParams": {
                    "diskType": format!(
                        "projects/{}/zones/{}/diskTypes/{}",
                        opts.project_id, opts.zone, opts.disk_type
                    ),
                    "sourceImage": opts.vm_image,
                    "diskSizeGb": opts.disk_size.to_string(),
                },
            }],
            "networkInterfaces": [{
                "name": "global/networks/default",
                "accessConfigs": [{
                    "name": "External NAT",
                    "type": "ONE_TO_ONE_NAT",
                }],
            }],
            "metadata": {
                "items": [{
                    "key": "startup-script",
                    "value": spec.startup_script,
                }],
            },
        })
    }
}

#[async_trait]
impl ComputeProvider for GceClient {
    async fn create_instance(
        &self,
        opts: &TargetOptions,
        spec: &InstanceSpec,
        log: &mut LogSink,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/instances", self.zone_url(opts));
        tracing::info!(
            instance = %spec.name,
            zone = %opts.zone,
            machine_type = %opts.machine_type,
            "creating compute instance"
        );
        log.line("Creating virtual machine");

        let request = self.http.post(&url).json(&Self::insert_body(opts, spec));
        self.mutate(opts, request, "instance insert").await?;

        log.line("Virtual machine created");
        Ok(())
    }

    async fn start_instance(&self, opts: &TargetOptions, name: &str) -> Result<(), ProviderError> {
        tracing::info!(instance = %name, "starting compute instance");
        let url = format!("{}/start", self.instance_url(opts, name));
        self.mutate(opts, self.http.post(&url), "instance start").await
    }

    async fn stop_instance(&self, opts: &TargetOptions, name: &str) -> Result<(), ProviderError> {
        tracing::info!(instance = %name, "stopping compute instance");
        let url = format!("{}/stop", self.instance_url(opts, name));
        self.mutate(opts, self.http.post(&url), "instance stop").await
    }

    async fn delete_instance(&self, opts: &TargetOptions, name: &str) -> Result<(), ProviderError> {
        tracing::info!(instance = %name, "deleting compute instance");
        let url = self.instance_url(opts, name);
        self.mutate(opts, self.http.delete(&url), "instance delete").await
    }

    async fn get_instance(&self, opts: &TargetOptions, name: &str) -> Result<Instance, ProviderError> {
        let token = self.token(opts).await?;
        let url = self.instance_url(opts, name);
        let resp = self.send(self.http.get(&url), &token, "instance get").await?;
        resp.json::<Instance>()
            .await
            .map_err(|e| ProviderError::Serde(format!("failed to parse instance: {e}")))
    }
}
