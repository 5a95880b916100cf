use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Publish timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal bus error: {0}")]
    Internal(String),
}

impl BusError {
    pub fn code(&self) -> &'static str {
        match self {
            BusError::Transport(_) => "TRANSPORT_ERROR",
            BusError::Serialization(_) => "SERIALIZATION_ERROR",
            BusError::Io(_) => "IO_ERROR",
            BusError::Timeout { .. } => "TIMEOUT",
            BusError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
