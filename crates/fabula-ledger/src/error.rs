use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: u64 },

    #[error("Contention exceeded after {attempts} attempts")]
    ContentionExceeded { attempts: u32 },

    #[error("User state missing: {user_id}")]
    UserStateMissing { user_id: String },

    #[error(transparent)]
    Store(#[from] fabula_store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::ContentionExceeded { .. } => "CONTENTION_EXCEEDED",
            LedgerError::UserStateMissing { .. } => "NOT_FOUND",
            LedgerError::Store(e) => e.code(),
            LedgerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
