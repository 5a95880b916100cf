//! Gamification missions: template catalogue, assignment, progress tracking
//! with idempotent reward dispatch, and the reaction gate that validates raw
//! channel reactions before they enter the event flow.

pub mod error;
pub mod gate;
pub mod tracker;
pub mod types;

pub use error::{MissionError, Result};
pub use gate::{RawReaction, ReactionGate};
pub use tracker::MissionTracker;
pub use types::{Mission, MissionKind, MissionStatus, MissionTemplate};
