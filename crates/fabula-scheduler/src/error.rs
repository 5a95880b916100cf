use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] fabula_store::StoreError),

    #[error(transparent)]
    User(#[from] fabula_users::UserError),

    #[error(transparent)]
    Mission(#[from] fabula_missions::MissionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Store(e) => e.code(),
            SchedulerError::User(e) => e.code(),
            SchedulerError::Mission(e) => e.code(),
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
