use thiserror::Error;

/// Errors produced by the tether session layer.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("a session is already open for '{0}'")]
    AlreadyConnected(String),

    #[error("connection to {host} failed: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("failed to load port forward '{0}'")]
    PortForwardLoadFailed(String),

    #[error("failed to decrypt credential '{0}'")]
    CredentialDecryptFailed(String),

    #[error("prompt was cancelled")]
    PromptCancelled,

    #[error("a prompt is already outstanding for this session")]
    PromptBusy,

    #[error("network monitoring unavailable: {0}")]
    NetworkResourceUnavailable(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TetherResult<T> = Result<T, TetherError>;
