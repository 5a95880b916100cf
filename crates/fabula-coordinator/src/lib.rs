//! Cross-module workflow coordination.
//!
//! The coordinator consumes every bus event through one subscription,
//! serialises processing per user via mailboxes, realises the cross-module
//! orderings (reaction → mission → reward → hint → level), buffers
//! out-of-order arrivals for a bounded window, and replays incomplete
//! journaled workflows after a restart.

pub mod coordinator;
pub mod error;
pub mod mailbox;
pub mod steps;

pub use coordinator::WorkflowCoordinator;
pub use error::{CoordinatorError, Result};
pub use steps::CoordinatorStep;
