use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] fabula_store::StoreError),

    #[error(transparent)]
    Ledger(#[from] fabula_ledger::LedgerError),

    #[error(transparent)]
    Mission(#[from] fabula_missions::MissionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::Store(e) => e.code(),
            CoordinatorError::Ledger(e) => e.code(),
            CoordinatorError::Mission(e) => e.code(),
            CoordinatorError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
