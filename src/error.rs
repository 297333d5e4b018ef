use std::io;

/// Errors from provider operations.
///
/// Collaborators map their internal failures into these variants. The
/// `Display` text is what the orchestration caller sees and what lands in
/// the workspace/project log, so it stays short and stable.
#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("download URL not set. Did you forget to call initialize?")]
    NotInitialized,

    #[error("invalid target options: {0}")]
    InvalidTargetOptions(String),

    #[error("credential file not set in env/target options")]
    MissingCredentialFile,

    #[error("project id not set in env/target options")]
    MissingProjectId,

    #[error("invalid environment variable: {0}")]
    InvalidEnvVar(String),

    #[error("timeout: dialing timed out after {minutes} minutes")]
    DialTimeout { minutes: f64 },

    #[error("cancelled")]
    Cancelled,

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("compute error: {0}")]
    Compute(String),

    #[error("operation {name} failed: {message}")]
    Operation { name: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("command failed: code={code:?}, stderr={stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Serde(e.to_string())
    }
}

impl ProviderError {
    /// True for failures detected before any remote call was attempted.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProviderError::NotInitialized
                | ProviderError::InvalidTargetOptions(_)
                | ProviderError::MissingCredentialFile
                | ProviderError::MissingProjectId
                | ProviderError::InvalidEnvVar(_)
        )
    }
}
