use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TelegramError {
    pub fn code(&self) -> &'static str {
        match self {
            TelegramError::Transport(_) => "TRANSPORT_ERROR",
            TelegramError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TelegramError>;
