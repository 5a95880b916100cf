//! Credit/debit with idempotency keys and optimistic concurrency.
//!
//! Each operation runs inside one document-store transaction: replay check,
//! balance math, transaction append, cached-balance update. The event goes
//! out only after the commit stands; if publishing fails the replay queue
//! delivers it later, so the commit is never rolled back for a bus problem.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::to_value;
use tracing::{debug, info, instrument, warn};

use fabula_bus::EventBus;
use fabula_core::events::{Event, EventPayload};
use fabula_core::types::CorrelationId;
use fabula_store::{collections, DocumentStore, StoreError};
use fabula_users::UserState;

use crate::error::{LedgerError, Result};
use crate::types::LedgerEntry;

/// Optimistic-concurrency retries before giving up.
const CAS_ATTEMPTS: u32 = 5;
/// Base backoff between retries.
const CAS_BACKOFF_BASE_MS: u64 = 25;

/// Result of a credit or debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub balance_after: i64,
    /// True when the idempotency key had already been committed and the
    /// prior outcome was returned without re-applying.
    pub replayed: bool,
}

enum TxnOutcome {
    Applied(i64),
    Replayed(i64),
    Insufficient(i64),
}

pub struct CurrencyLedger {
    docs: Arc<DocumentStore>,
    bus: Arc<EventBus>,
}

impl CurrencyLedger {
    pub fn new(docs: Arc<DocumentStore>, bus: Arc<EventBus>) -> Self {
        Self { docs, bus }
    }

    /// Add `amount` to the user's balance.
    #[instrument(skip(self, correlation_id), fields(user_id, amount))]
    pub async fn credit(
        &self,
        user_id: &str,
        amount: u64,
        reason: &str,
        idempotency_key: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Receipt> {
        self.apply(user_id, amount as i64, reason, idempotency_key, correlation_id)
            .await
    }

    /// Remove `amount` from the user's balance; fails with
    /// `InsufficientFunds` when the balance cannot cover it.
    #[instrument(skip(self, correlation_id), fields(user_id, amount))]
    pub async fn debit(
        &self,
        user_id: &str,
        amount: u64,
        reason: &str,
        idempotency_key: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Receipt> {
        self.apply(user_id, -(amount as i64), reason, idempotency_key, correlation_id)
            .await
    }

    /// Committed balance for a user, straight from the state document.
    pub fn balance(&self, user_id: &str) -> Result<i64> {
        let doc = self
            .docs
            .get(collections::USERS, user_id)?
            .ok_or_else(|| LedgerError::UserStateMissing {
                user_id: user_id.to_string(),
            })?;
        let state: UserState = serde_json::from_value(doc.body)?;
        Ok(state.balance)
    }

    /// All committed transactions for a user, oldest first.
    pub fn history(&self, user_id: &str) -> Result<Vec<LedgerEntry>> {
        let docs = self
            .docs
            .find_by_field(collections::CURRENCY_TRANSACTIONS, "$.user_id", user_id)?;
        let mut entries: Vec<LedgerEntry> = docs
            .into_iter()
            .filter_map(|d| serde_json::from_value(d.body).ok())
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    async fn apply(
        &self,
        user_id: &str,
        delta: i64,
        reason: &str,
        idempotency_key: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Receipt> {
        let correlation = correlation_id.unwrap_or_default();

        for attempt in 1..=CAS_ATTEMPTS {
            let outcome = self.docs.txn(|tx| {
                // Idempotent replay: a committed key returns its prior result.
                if let Some(prior) = tx.get(collections::CURRENCY_TRANSACTIONS, idempotency_key)? {
                    let entry: LedgerEntry = serde_json::from_value(prior.body)
                        .map_err(|e| StoreError::Serialization(e))?;
                    return Ok(TxnOutcome::Replayed(entry.balance_after));
                }

                let user_doc = tx.get(collections::USERS, user_id)?.ok_or_else(|| {
                    StoreError::NotFound {
                        collection: collections::USERS.to_string(),
                        id: user_id.to_string(),
                    }
                })?;
                let mut state: UserState = serde_json::from_value(user_doc.body)
                    .map_err(StoreError::Serialization)?;

                let new_balance = state.balance + delta;
                if new_balance < 0 {
                    return Ok(TxnOutcome::Insufficient(state.balance));
                }

                let entry = LedgerEntry {
                    txn_id: idempotency_key.to_string(),
                    user_id: user_id.to_string(),
                    delta,
                    reason: reason.to_string(),
                    correlation_id: correlation.to_string(),
                    balance_after: new_balance,
                    created_at: Utc::now().to_rfc3339(),
                };
                tx.insert(
                    collections::CURRENCY_TRANSACTIONS,
                    idempotency_key,
                    &to_value(&entry).map_err(StoreError::Serialization)?,
                )?;

                state.balance = new_balance;
                tx.compare_and_put(
                    collections::USERS,
                    user_id,
                    user_doc.version,
                    &to_value(&state).map_err(StoreError::Serialization)?,
                )?;

                Ok(TxnOutcome::Applied(new_balance))
            });

            match outcome {
                Ok(TxnOutcome::Applied(balance_after)) => {
                    info!(user_id, delta, balance_after, reason, "ledger entry committed");
                    self.publish(user_id, delta, balance_after, reason, idempotency_key, &correlation)
                        .await;
                    return Ok(Receipt {
                        balance_after,
                        replayed: false,
                    });
                }
                Ok(TxnOutcome::Replayed(balance_after)) => {
                    debug!(user_id, idempotency_key, "idempotent replay, no re-apply");
                    return Ok(Receipt {
                        balance_after,
                        replayed: true,
                    });
                }
                Ok(TxnOutcome::Insufficient(balance)) => {
                    return Err(LedgerError::InsufficientFunds {
                        balance,
                        requested: delta.unsigned_abs(),
                    });
                }
                Err(StoreError::VersionConflict { .. }) if attempt < CAS_ATTEMPTS => {
                    let backoff = CAS_BACKOFF_BASE_MS << (attempt - 1);
                    warn!(user_id, attempt, "balance write contended, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(LedgerError::ContentionExceeded {
                        attempts: CAS_ATTEMPTS,
                    });
                }
                Err(StoreError::NotFound { collection, id })
                    if collection == collections::USERS =>
                {
                    return Err(LedgerError::UserStateMissing { user_id: id });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LedgerError::ContentionExceeded {
            attempts: CAS_ATTEMPTS,
        })
    }

    async fn publish(
        &self,
        user_id: &str,
        delta: i64,
        balance_after: i64,
        reason: &str,
        idempotency_key: &str,
        correlation: &CorrelationId,
    ) {
        let payload = if delta >= 0 {
            EventPayload::CurrencyCredited {
                user_id: user_id.to_string(),
                amount: delta.unsigned_abs(),
                balance_after,
                reason: reason.to_string(),
                idempotency_key: idempotency_key.to_string(),
            }
        } else {
            EventPayload::CurrencyDebited {
                user_id: user_id.to_string(),
                amount: delta.unsigned_abs(),
                balance_after,
                reason: reason.to_string(),
                idempotency_key: idempotency_key.to_string(),
            }
        };
        let event = Event::new("ledger", Some(correlation.clone()), payload);
        if let Err(e) = self.bus.publish(event).await {
            // The commit stands; the replay queue owns eventual delivery.
            warn!(error = %e, "ledger event could not be published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use fabula_bus::{LocalReplayQueue, MemoryTransport};

    fn fixture() -> (CurrencyLedger, Arc<DocumentStore>) {
        let docs = Arc::new(DocumentStore::open_in_memory().unwrap());
        let dir = std::env::temp_dir().join(format!("fabula-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let (bus, _dlq) = EventBus::new(
            Arc::new(MemoryTransport::new()),
            LocalReplayQueue::open(dir.join("replay.jsonl"), 100).unwrap(),
        );
        let ledger = CurrencyLedger::new(Arc::clone(&docs), bus);
        docs.insert(
            collections::USERS,
            "u-1",
            &to_value(UserState::new("u-1")).unwrap(),
        )
        .unwrap();
        (ledger, docs)
    }

    #[tokio::test]
    async fn credit_then_debit_updates_balance() {
        let (ledger, _docs) = fixture();
        let r1 = ledger
            .credit("u-1", 50, "test", &keys::derive(&["c1"]), None)
            .await
            .unwrap();
        assert_eq!(r1.balance_after, 50);

        let r2 = ledger
            .debit("u-1", 20, "test", &keys::derive(&["d1"]), None)
            .await
            .unwrap();
        assert_eq!(r2.balance_after, 30);
        assert_eq!(ledger.balance("u-1").unwrap(), 30);
    }

    #[tokio::test]
    async fn replay_returns_prior_outcome_without_reapplying() {
        let (ledger, _docs) = fixture();
        let key = keys::derive(&["mission", "m-1"]);

        let first = ledger.credit("u-1", 10, "reward", &key, None).await.unwrap();
        assert!(!first.replayed);

        for _ in 0..3 {
            let again = ledger.credit("u-1", 10, "reward", &key, None).await.unwrap();
            assert!(again.replayed);
            assert_eq!(again.balance_after, first.balance_after);
        }
        assert_eq!(ledger.balance("u-1").unwrap(), 10);
        assert_eq!(ledger.history("u-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn debit_beyond_balance_is_rejected() {
        let (ledger, _docs) = fixture();
        ledger
            .credit("u-1", 5, "seed", &keys::derive(&["seed"]), None)
            .await
            .unwrap();

        let err = ledger
            .debit("u-1", 6, "overdraft", &keys::derive(&["over"]), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        // A rejected debit leaves no trace in the log.
        assert_eq!(ledger.history("u-1").unwrap().len(), 1);
        assert_eq!(ledger.balance("u-1").unwrap(), 5);
    }

    #[tokio::test]
    async fn balance_always_equals_sum_of_deltas() {
        let (ledger, _docs) = fixture();
        ledger.credit("u-1", 100, "a", &keys::derive(&["a"]), None).await.unwrap();
        ledger.debit("u-1", 30, "b", &keys::derive(&["b"]), None).await.unwrap();
        ledger.credit("u-1", 7, "c", &keys::derive(&["c"]), None).await.unwrap();
        ledger.debit("u-1", 77, "d", &keys::derive(&["d"]), None).await.unwrap();

        let history = ledger.history("u-1").unwrap();
        let sum: i64 = history.iter().map(|e| e.delta).sum();
        assert_eq!(sum, ledger.balance("u-1").unwrap());
        assert_eq!(history.last().unwrap().balance_after, sum);
    }

    #[tokio::test]
    async fn debit_then_fresh_credit_restores_balance() {
        let (ledger, _docs) = fixture();
        ledger.credit("u-1", 40, "seed", &keys::derive(&["seed2"]), None).await.unwrap();

        let key = keys::derive(&["purchase", "p-1"]);
        ledger.debit("u-1", 15, "purchase", &key, None).await.unwrap();
        ledger
            .credit("u-1", 15, "refund", &keys::compensation(&key), None)
            .await
            .unwrap();
        assert_eq!(ledger.balance("u-1").unwrap(), 40);

        // Re-running the compensation is a no-op.
        let again = ledger
            .credit("u-1", 15, "refund", &keys::compensation(&key), None)
            .await
            .unwrap();
        assert!(again.replayed);
        assert_eq!(ledger.balance("u-1").unwrap(), 40);
    }

    #[tokio::test]
    async fn unknown_user_is_reported() {
        let (ledger, _docs) = fixture();
        let err = ledger
            .credit("ghost", 1, "x", &keys::derive(&["x"]), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
