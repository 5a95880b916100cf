//! Virtual-currency ledger: idempotent, atomically committed credits and
//! debits with an append-only transaction log.

pub mod error;
pub mod keys;
pub mod ledger;
pub mod types;

pub use error::{LedgerError, Result};
pub use ledger::{CurrencyLedger, Receipt};
pub use types::LedgerEntry;
