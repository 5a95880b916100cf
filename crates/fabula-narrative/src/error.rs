use thiserror::Error;

use fabula_users::DenyReason;

#[derive(Debug, Error)]
pub enum NarrativeError {
    #[error("Invalid choice: {detail}")]
    InvalidChoice { detail: String },

    #[error("Access denied: {}", .reason.code())]
    AccessDenied { reason: DenyReason },

    #[error("Fragment not found: {fragment_id}")]
    FragmentNotFound { fragment_id: String },

    #[error("Hint not found: {hint_id}")]
    HintNotFound { hint_id: String },

    #[error("User state missing: {user_id}")]
    UserStateMissing { user_id: String },

    #[error("Partial failure in workflow {workflow_id}: {detail}")]
    PartialFailure { workflow_id: String, detail: String },

    #[error(transparent)]
    Store(#[from] fabula_store::StoreError),

    #[error(transparent)]
    Ledger(#[from] fabula_ledger::LedgerError),

    #[error(transparent)]
    User(#[from] fabula_users::UserError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NarrativeError {
    pub fn code(&self) -> &'static str {
        match self {
            NarrativeError::InvalidChoice { .. } => "INVALID_CHOICE",
            NarrativeError::AccessDenied { .. } => "ACCESS_DENIED",
            NarrativeError::FragmentNotFound { .. } => "NOT_FOUND",
            NarrativeError::HintNotFound { .. } => "NOT_FOUND",
            NarrativeError::UserStateMissing { .. } => "NOT_FOUND",
            NarrativeError::PartialFailure { .. } => "PARTIAL_FAILURE",
            NarrativeError::Store(e) => e.code(),
            NarrativeError::Ledger(e) => e.code(),
            NarrativeError::User(e) => e.code(),
            NarrativeError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, NarrativeError>;
