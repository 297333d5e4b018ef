//! Private mesh-network tunnel.
//!
//! Workspaces boot with no public path for the provider to use; the only
//! route in is the mesh network the remote agent joins. `TunnelManager`
//! establishes one outbound mesh connection per orchestrator and hands it out
//! for dialing.

pub mod bridge;
pub mod dial_wait;
pub mod mesh;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OnceCell;

use crate::error::ProviderError;

pub use bridge::LoopbackBridge;
pub use dial_wait::{DialWaitPolicy, wait_for_reachable};
pub use mesh::UserspaceMeshConnector;

/// Byte stream to a remote endpoint, carried over the tunnel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// An established mesh connection.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Hostname this side advertises on the mesh.
    fn hostname(&self) -> &str;

    /// Open a TCP connection to `host:port` through the mesh.
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Parameters for joining the mesh.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub auth_key: String,
    pub control_url: String,
    /// Isolated state directory, unique per connection.
    pub state_dir: PathBuf,
    pub hostname: String,
}

/// Establishes tunnels. The only place mesh credentials are used.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(&self, config: TunnelConfig) -> Result<Arc<dyn Tunnel>, ProviderError>;
}

/// Lazily establishes and memoizes the orchestrator's tunnel.
///
/// Concurrent first callers wait on the same initialization; a failed attempt
/// leaves the cell empty so the next caller tries again.
pub struct TunnelManager {
    connector: Arc<dyn TunnelConnector>,
    auth_key: String,
    control_url: String,
    base_path: PathBuf,
    connection: OnceCell<Arc<dyn Tunnel>>,
}

impl TunnelManager {
    pub fn new(
        connector: Arc<dyn TunnelConnector>,
        auth_key: String,
        control_url: String,
        base_path: PathBuf,
    ) -> Self {
        Self {
            connector,
            auth_key,
            control_url,
            base_path,
            connection: OnceCell::new(),
        }
    }

    /// Return the tunnel, establishing it on first use.
    pub async fn connection(&self) -> Result<Arc<dyn Tunnel>, ProviderError> {
        let tunnel = self
            .connection
            .get_or_try_init(|| async {
                let config = self.fresh_config();
                tracing::info!(
                    hostname = %config.hostname,
                    state_dir = %config.state_dir.display(),
                    "establishing mesh tunnel"
                );
                self.connector.connect(config).await
            })
            .await?;
        Ok(tunnel.clone())
    }

    fn fresh_config(&self) -> TunnelConfig {
        TunnelConfig {
            auth_key: self.auth_key.clone(),
            control_url: self.control_url.clone(),
            state_dir: self
                .base_path
                .join("tunnel")
                .join(uuid::Uuid::new_v4().to_string()),
            hostname: format!("gcp-provider-{}", uuid::Uuid::new_v4()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::testing::LoopbackTunnel;

    struct CountingConnector {
        calls: AtomicUsize,
        fail_first: bool,
        seen: Mutex<Vec<TunnelConfig>>,
    }

    #[async_trait]
    impl TunnelConnector for CountingConnector {
        async fn connect(&self, config: TunnelConfig) -> Result<Arc<dyn Tunnel>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(config.clone());
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail_first && call == 0 {
                return Err(ProviderError::Tunnel("control plane unreachable".into()));
            }
            Ok(Arc::new(LoopbackTunnel::new(config.hostname)))
        }
    }

    fn manager(fail_first: bool) -> (Arc<CountingConnector>, TunnelManager) {
        let connector = Arc::new(CountingConnector {
            calls: AtomicUsize::new(0),
            fail_first,
            seen: Mutex::new(Vec::new()),
        });
        let manager = TunnelManager::new(
            connector.clone(),
            "tskey-test".into(),
            "https://control.example".into(),
            PathBuf::from("/tmp/provider"),
        );
        (connector, manager)
    }

    #[tokio::test]
    async fn connection_is_memoized() {
        let (connector, manager) = manager(false);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);

        let first = manager.connection().await.unwrap();
        let second = manager.connection().await.unwrap();
        assert_eq!(first.hostname(), second.hostname());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_connect() {
        let (connector, manager) = manager(false);
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connection().await.map(|t| t.hostname().to_string()) })
            })
            .collect();

        let mut hostnames = Vec::new();
        for handle in handles {
            hostnames.push(handle.await.unwrap().unwrap());
        }
        hostnames.dedup();
        assert_eq!(hostnames.len(), 1);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_propagates_and_is_not_cached() {
        let (connector, manager) = manager(true);

        let err = manager.connection().await.err().unwrap();
        assert!(err.to_string().contains("control plane unreachable"));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);

        manager.connection().await.unwrap();
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn config_uses_isolated_state_dir_and_random_hostname() {
        let (connector, manager) = manager(true);
        let _ = manager.connection().await;
        let _ = manager.connection().await;

        let seen = connector.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].state_dir, seen[1].state_dir);
        assert_ne!(seen[0].hostname, seen[1].hostname);
        assert!(seen[0].hostname.starts_with("gcp-provider-"));
        assert!(seen[0].state_dir.starts_with("/tmp/provider/tunnel"));
        assert_eq!(seen[0].auth_key, "tskey-test");
        assert_eq!(seen[0].control_url, "https://control.example");
    }
}
