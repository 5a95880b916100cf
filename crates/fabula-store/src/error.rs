use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document already exists: {collection}/{id}")]
    AlreadyExists { collection: String, id: String },

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Version conflict on {collection}/{id} (expected {expected})")]
    VersionConflict {
        collection: String,
        id: String,
        expected: i64,
    },

    #[error("Store degraded: {dependency} breaker is open")]
    Degraded { dependency: &'static str },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::AlreadyExists { .. } => "ALREADY_EXISTS",
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::VersionConflict { .. } => "VERSION_CONFLICT",
            StoreError::Degraded { .. } => "SERVICE_DEGRADED",
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::Serialization(_) => "SERIALIZATION_ERROR",
            StoreError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
