//! Remote shell sessions on a workspace host, reached through the tunnel.

pub mod ssh;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::tunnel::Tunnel;

pub use ssh::SshSessionConnector;

/// An open shell session on a workspace host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command` through the remote shell and return its stdout.
    async fn exec(&self, command: &str) -> Result<String, ProviderError>;

    /// Tear the session down. Calling it more than once is harmless.
    async fn close(&self) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(
        &self,
        tunnel: Arc<dyn Tunnel>,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn RemoteSession>, ProviderError>;
}

/// Close `session`, logging rather than returning any failure.
pub async fn close_quietly(session: &dyn RemoteSession) {
    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "failed to close remote session");
    }
}
