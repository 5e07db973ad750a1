use std::io;

/// Errors shared across the orchestration core. Crate-specific errors wrap
/// or convert into this one at the boundaries that the orchestrator touches
/// directly (IPC, permission, history, engine).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("write deadline exceeded after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("read deadline exceeded after {0:?}")]
    ReadTimeout(std::time::Duration),

    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("daemon reported failure: {0}")]
    ProtocolError(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("store busy, retries exhausted")]
    StoreBusy,

    #[error("empty streaming response")]
    EmptyStream,

    #[error("max follow-up passes reached")]
    MaxFollowUps,

    #[error("request cancelled")]
    Cancelled,

    #[error("secret not found: {0}")]
    SecretNotFound(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
