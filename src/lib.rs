pub mod compute;
pub mod config;
pub mod error;
pub mod logs;
pub mod provider;
pub mod runtime;
pub mod server;
pub mod session;
pub mod tunnel;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::ProviderError;
pub use provider::{Collaborators, GcpProvider, ProviderConfig};
