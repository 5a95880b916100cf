//! Branching narrative: fragment delivery with VIP gating, choice
//! processing, and the atomic hint ("pista") purchase workflow.

pub mod engine;
pub mod error;
pub mod shop;
pub mod types;

pub use engine::{ChoiceOutcome, NarrativeEngine};
pub use error::{NarrativeError, Result};
pub use shop::{PistaShop, PurchaseOutcome};
pub use types::{Choice, Fragment, Hint, Preconditions, Rewards, Unlocks};
