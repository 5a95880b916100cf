use thiserror::Error;

#[derive(Debug, Error)]
pub enum MissionError {
    #[error("Mission template not found: {template_id}")]
    TemplateNotFound { template_id: String },

    #[error("Mission not found: {mission_id}")]
    MissionNotFound { mission_id: String },

    #[error(transparent)]
    Store(#[from] fabula_store::StoreError),

    #[error(transparent)]
    Ledger(#[from] fabula_ledger::LedgerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MissionError {
    pub fn code(&self) -> &'static str {
        match self {
            MissionError::TemplateNotFound { .. } => "NOT_FOUND",
            MissionError::MissionNotFound { .. } => "NOT_FOUND",
            MissionError::Store(e) => e.code(),
            MissionError::Ledger(e) => e.code(),
            MissionError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, MissionError>;
