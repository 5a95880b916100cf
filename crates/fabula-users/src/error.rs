use thiserror::Error;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("User already exists for external id {external_id}")]
    AlreadyExists { external_id: i64 },

    #[error("User not found: {id}")]
    NotFound { id: String },

    #[error("Stores inconsistent for user {user_id}: {detail}")]
    StoreInconsistency { user_id: String, detail: String },

    #[error("Illegal subscription transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Subscription not found: {id}")]
    SubscriptionNotFound { id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Store(#[from] fabula_store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UserError {
    pub fn code(&self) -> &'static str {
        match self {
            UserError::AlreadyExists { .. } => "ALREADY_EXISTS",
            UserError::NotFound { .. } => "NOT_FOUND",
            UserError::StoreInconsistency { .. } => "STORE_INCONSISTENCY",
            UserError::InvalidTransition { .. } => "INVALID_TRANSITION",
            UserError::SubscriptionNotFound { .. } => "NOT_FOUND",
            UserError::Database(_) => "DATABASE_ERROR",
            UserError::Store(e) => e.code(),
            UserError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, UserError>;
