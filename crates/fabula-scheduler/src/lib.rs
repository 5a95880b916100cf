//! Time-driven duties: scheduled channel posts and the periodic expiry
//! sweeps for subscriptions and missions.

pub mod engine;
pub mod error;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use types::{PostStatus, ScheduledPost};
