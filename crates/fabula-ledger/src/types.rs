use serde::{Deserialize, Serialize};

/// One committed currency transaction, append-only in the
/// `currency_transactions` collection keyed by its idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Idempotency key; doubles as the document id.
    pub txn_id: String,
    pub user_id: String,
    /// Signed amount: positive for credits, negative for debits.
    pub delta: i64,
    pub reason: String,
    pub correlation_id: String,
    /// User balance after this transaction committed. Always equals the sum
    /// of deltas over this and all prior transactions for the user.
    pub balance_after: i64,
    pub created_at: String,
}
