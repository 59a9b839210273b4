use thiserror::Error;

/// Errors produced by the comet protocol layer.
#[derive(Debug, Error)]
pub enum CometError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("extension error: {0}")]
    Extension(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CometError {
    fn from(e: serde_json::Error) -> Self {
        CometError::Codec(e.to_string())
    }
}

pub type CometResult<T> = Result<T, CometError>;
