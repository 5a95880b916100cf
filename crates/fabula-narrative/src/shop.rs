//! Pista shop: spend currency, unlock a hint, maybe promote the narrative
//! level, atomically from the user's point of view.
//!
//! The debit and the unlock are separate commits, so the gap between them is
//! journaled: a crash or failure after the debit triggers a compensating
//! credit under a key derived from the original one, which makes the refund
//! itself idempotent.

use std::sync::Arc;

use serde_json::{json, to_value};
use tracing::{error, info, instrument, warn};

use fabula_bus::EventBus;
use fabula_core::events::{Event, EventPayload};
use fabula_core::types::CorrelationId;
use fabula_ledger::{keys, CurrencyLedger};
use fabula_store::{collections, AdminLog, AdminLogKind, DocumentStore, StoreError, WorkflowJournal};
use fabula_users::UserState;

use crate::error::{NarrativeError, Result};
use crate::types::Hint;

/// Retries for the unlock write when it races another writer.
const UNLOCK_ATTEMPTS: u32 = 3;

/// What a purchase produced.
#[derive(Debug, Clone)]
pub struct PurchaseOutcome {
    pub hint_id: String,
    pub balance_after: i64,
    /// False when the hint was already owned (idempotent replay).
    pub newly_unlocked: bool,
    /// (old, new) when the hint promoted the user's narrative level.
    pub level_change: Option<(u32, u32)>,
}

pub struct PistaShop {
    docs: Arc<DocumentStore>,
    ledger: Arc<CurrencyLedger>,
    bus: Arc<EventBus>,
    journal: WorkflowJournal,
    audit: AdminLog,
}

impl PistaShop {
    pub fn new(
        docs: Arc<DocumentStore>,
        ledger: Arc<CurrencyLedger>,
        bus: Arc<EventBus>,
        journal: WorkflowJournal,
        audit: AdminLog,
    ) -> Self {
        Self {
            docs,
            ledger,
            bus,
            journal,
            audit,
        }
    }

    pub fn hint(&self, hint_id: &str) -> Result<Hint> {
        let doc = self
            .docs
            .get(collections::HINTS, hint_id)?
            .ok_or_else(|| NarrativeError::HintNotFound {
                hint_id: hint_id.to_string(),
            })?;
        Ok(serde_json::from_value(doc.body)?)
    }

    /// Every hint on offer, for the shop listing.
    pub fn catalogue(&self) -> Result<Vec<Hint>> {
        Ok(self
            .docs
            .list(collections::HINTS)?
            .into_iter()
            .filter_map(|d| serde_json::from_value(d.body).ok())
            .collect())
    }

    /// Purchase a hint for a user.
    ///
    /// Re-submitting the same purchase is safe: the debit key is derived
    /// from (user, hint), so the ledger replays it, and an already-owned
    /// hint produces no second unlock event.
    #[instrument(skip(self, correlation_id), fields(user_id, hint_id))]
    pub async fn purchase(
        &self,
        user_id: &str,
        hint_id: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<PurchaseOutcome> {
        let hint = self.hint(hint_id)?;
        let correlation = correlation_id.unwrap_or_default();
        let debit_key = keys::derive(&[user_id, hint_id, "v1"]);

        let workflow = self.journal.begin(
            "pista_purchase",
            user_id,
            "debit",
            json!({ "hint_id": hint_id, "debit_key": debit_key, "cost": hint.cost_currency }),
        )?;

        if let Err(e) = self
            .ledger
            .debit(
                user_id,
                hint.cost_currency,
                "pista_purchase",
                &debit_key,
                Some(correlation.clone()),
            )
            .await
        {
            // Nothing was charged; close the workflow and surface the error.
            self.journal.fail(&workflow.workflow_id, &e.to_string())?;
            return Err(e.into());
        }

        self.journal.checkpoint(
            &workflow.workflow_id,
            "unlock",
            json!({ "hint_id": hint_id, "debit_key": debit_key }),
        )?;

        match self.unlock(user_id, &hint).await {
            Ok((newly_unlocked, level_change)) => {
                self.journal.complete(&workflow.workflow_id)?;

                if newly_unlocked {
                    self.publish(
                        Some(correlation.clone()),
                        EventPayload::HintUnlocked {
                            user_id: user_id.to_string(),
                            hint_id: hint_id.to_string(),
                        },
                    )
                    .await;
                }
                if let Some((old_level, new_level)) = level_change {
                    self.publish(
                        Some(correlation),
                        EventPayload::NarrativeLevelChanged {
                            user_id: user_id.to_string(),
                            old_level,
                            new_level,
                            trigger: "hint".to_string(),
                        },
                    )
                    .await;
                }

                Ok(PurchaseOutcome {
                    hint_id: hint_id.to_string(),
                    balance_after: self.ledger.balance(user_id)?,
                    newly_unlocked,
                    level_change,
                })
            }
            Err(unlock_err) => {
                self.compensate(user_id, &debit_key, &hint, &workflow.workflow_id, &unlock_err, correlation)
                    .await
            }
        }
    }

    /// Add the hint to the user's inventory and apply a level promotion.
    /// Returns (newly_unlocked, level_change).
    async fn unlock(&self, user_id: &str, hint: &Hint) -> Result<(bool, Option<(u32, u32)>)> {
        for _ in 0..UNLOCK_ATTEMPTS {
            let doc = self.docs.get(collections::USERS, user_id)?.ok_or_else(|| {
                NarrativeError::UserStateMissing {
                    user_id: user_id.to_string(),
                }
            })?;
            let mut state: UserState = serde_json::from_value(doc.body)?;

            let newly_unlocked = !state.has_hint(&hint.hint_id);
            if newly_unlocked {
                state.unlocked_hints.push(hint.hint_id.clone());
            }

            let mut level_change = None;
            if let Some(target) = hint.unlocks.level_promotion {
                if state.narrative_level < target {
                    level_change = Some((state.narrative_level, target));
                    state.narrative_level = target;
                }
            }

            if !newly_unlocked && level_change.is_none() {
                return Ok((false, None));
            }

            match self.docs.compare_and_put(
                collections::USERS,
                user_id,
                doc.version,
                &to_value(&state)?,
            ) {
                Ok(_) => return Ok((newly_unlocked, level_change)),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(NarrativeError::Store(StoreError::VersionConflict {
            collection: collections::USERS.to_string(),
            id: user_id.to_string(),
            expected: 0,
        }))
    }

    /// Refund a debit whose unlock failed. The compensation key is derived
    /// from the original key, so retrying a half-failed purchase can never
    /// refund twice.
    async fn compensate(
        &self,
        user_id: &str,
        debit_key: &str,
        hint: &Hint,
        workflow_id: &str,
        unlock_err: &NarrativeError,
        correlation: CorrelationId,
    ) -> Result<PurchaseOutcome> {
        warn!(
            user_id,
            hint_id = %hint.hint_id,
            error = %unlock_err,
            "unlock failed after debit, issuing compensating credit"
        );

        let comp_key = keys::compensation(debit_key);
        match self
            .ledger
            .credit(
                user_id,
                hint.cost_currency,
                "pista_purchase_refund",
                &comp_key,
                Some(correlation),
            )
            .await
        {
            Ok(_) => {
                self.journal.fail(workflow_id, &unlock_err.to_string())?;
                self.audit.append_best_effort(
                    AdminLogKind::CompensationApplied,
                    Some(user_id),
                    json!({
                        "workflow_id": workflow_id,
                        "hint_id": hint.hint_id,
                        "error": unlock_err.to_string(),
                    }),
                );
                Err(NarrativeError::PartialFailure {
                    workflow_id: workflow_id.to_string(),
                    detail: "purchase refunded after unlock failure".to_string(),
                })
            }
            Err(comp_err) => {
                error!(user_id, error = %comp_err, "compensating credit failed");
                self.journal.fail(workflow_id, &comp_err.to_string())?;
                self.audit.append_best_effort(
                    AdminLogKind::CompensationFailed,
                    Some(user_id),
                    json!({
                        "workflow_id": workflow_id,
                        "hint_id": hint.hint_id,
                        "unlock_error": unlock_err.to_string(),
                        "compensation_error": comp_err.to_string(),
                    }),
                );
                Err(NarrativeError::PartialFailure {
                    workflow_id: workflow_id.to_string(),
                    detail: "refund failed, support intervention required".to_string(),
                })
            }
        }
    }

    async fn publish(&self, correlation_id: Option<CorrelationId>, payload: EventPayload) {
        let event = Event::new("pista_shop", correlation_id, payload);
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "shop event could not be published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Unlocks;
    use fabula_bus::{LocalReplayQueue, MemoryTransport};

    struct Fixture {
        shop: PistaShop,
        ledger: Arc<CurrencyLedger>,
        docs: Arc<DocumentStore>,
        bus: Arc<EventBus>,
    }

    async fn fixture(seed_balance: u64) -> Fixture {
        let docs = Arc::new(DocumentStore::open_in_memory().unwrap());
        let dir = std::env::temp_dir().join(format!("fabula-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let (bus, _dlq) = EventBus::new(
            Arc::new(MemoryTransport::new()),
            LocalReplayQueue::open(dir.join("replay.jsonl"), 100).unwrap(),
        );
        let ledger = Arc::new(CurrencyLedger::new(Arc::clone(&docs), Arc::clone(&bus)));

        docs.insert(
            collections::USERS,
            "u-1",
            &to_value(UserState::new("u-1")).unwrap(),
        )
        .unwrap();
        if seed_balance > 0 {
            ledger
                .credit("u-1", seed_balance, "seed", &keys::derive(&["seed"]), None)
                .await
                .unwrap();
        }

        let hint = Hint {
            hint_id: "access_level_2".into(),
            title: "Pista del segundo nivel".into(),
            cost_currency: 10,
            unlocks: Unlocks {
                fragment_ids: vec!["sala_2".into()],
                level_promotion: Some(2),
            },
        };
        docs.insert(collections::HINTS, &hint.hint_id.clone(), &to_value(&hint).unwrap())
            .unwrap();

        let journal = WorkflowJournal::new(Arc::clone(&docs));
        let audit = AdminLog::new(Arc::clone(&docs));
        let shop = PistaShop::new(
            Arc::clone(&docs),
            Arc::clone(&ledger),
            Arc::clone(&bus),
            journal,
            audit,
        );
        Fixture {
            shop,
            ledger,
            docs,
            bus,
        }
    }

    #[tokio::test]
    async fn purchase_debits_unlocks_and_promotes() {
        let fx = fixture(10).await;
        let outcome = fx.shop.purchase("u-1", "access_level_2", None).await.unwrap();

        assert!(outcome.newly_unlocked);
        assert_eq!(outcome.balance_after, 0);
        assert_eq!(outcome.level_change, Some((1, 2)));

        let doc = fx.docs.get(collections::USERS, "u-1").unwrap().unwrap();
        let state: UserState = serde_json::from_value(doc.body).unwrap();
        assert!(state.has_hint("access_level_2"));
        assert_eq!(state.narrative_level, 2);
    }

    #[tokio::test]
    async fn replayed_purchase_changes_nothing() {
        let fx = fixture(10).await;
        fx.shop.purchase("u-1", "access_level_2", None).await.unwrap();
        let events_before = fx.bus.counters.snapshot().published;

        let again = fx.shop.purchase("u-1", "access_level_2", None).await.unwrap();
        assert!(!again.newly_unlocked);
        assert_eq!(again.balance_after, 0);
        assert_eq!(again.level_change, None);
        // No hint_unlocked / level_changed / currency events on replay.
        assert_eq!(fx.bus.counters.snapshot().published, events_before);
        assert_eq!(fx.ledger.balance("u-1").unwrap(), 0);
    }

    #[tokio::test]
    async fn insufficient_funds_charges_nothing() {
        let fx = fixture(3).await;
        let err = fx.shop.purchase("u-1", "access_level_2", None).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(fx.ledger.balance("u-1").unwrap(), 3);

        let doc = fx.docs.get(collections::USERS, "u-1").unwrap().unwrap();
        let state: UserState = serde_json::from_value(doc.body).unwrap();
        assert!(!state.has_hint("access_level_2"));
    }

    #[tokio::test]
    async fn unknown_hint_is_not_found() {
        let fx = fixture(10).await;
        let err = fx.shop.purchase("u-1", "no_such_hint", None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn unlock_failure_is_compensated_once() {
        let fx = fixture(10).await;
        // Simulate a crash between debit and unlock: commit the debit under
        // the purchase key, then remove the state document.
        fx.ledger
            .debit(
                "u-1",
                10,
                "pista_purchase",
                &keys::derive(&["u-1", "access_level_2", "v1"]),
                None,
            )
            .await
            .unwrap();
        fx.docs.delete(collections::USERS, "u-1").unwrap();

        // The purchase replays the debit (already committed) and then fails
        // to unlock because the state document is gone.
        let err = fx.shop.purchase("u-1", "access_level_2", None).await.unwrap_err();
        assert_eq!(err.code(), "PARTIAL_FAILURE");

        // Compensation also needs the user document, so it failed too and
        // the incident is on record.
        let entries = fx
            .docs
            .find_by_field(collections::ADMIN_LOGS, "$.kind", "compensation_failed")
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn compensated_purchase_restores_balance() {
        let fx = fixture(10).await;

        // Commit the debit, then drive the compensation path directly, as
        // the purchase flow would after an unlock failure.
        let debit_key = keys::derive(&["u-1", "access_level_2", "v1"]);
        fx.ledger
            .debit("u-1", 10, "pista_purchase", &debit_key, None)
            .await
            .unwrap();

        let hint = fx.shop.hint("access_level_2").unwrap();
        let workflow = fx
            .shop
            .journal
            .begin("pista_purchase", "u-1", "unlock", json!({}))
            .unwrap();
        let unlock_err = NarrativeError::UserStateMissing {
            user_id: "u-1".into(),
        };
        let result = fx
            .shop
            .compensate(
                "u-1",
                &debit_key,
                &hint,
                &workflow.workflow_id,
                &unlock_err,
                CorrelationId::new(),
            )
            .await;
        assert!(matches!(result, Err(NarrativeError::PartialFailure { .. })));
        // Refund restored the pre-purchase balance.
        assert_eq!(fx.ledger.balance("u-1").unwrap(), 10);

        // A second compensation replays and does not double-refund.
        let workflow2 = fx
            .shop
            .journal
            .begin("pista_purchase", "u-1", "unlock", json!({}))
            .unwrap();
        let _ = fx
            .shop
            .compensate(
                "u-1",
                &debit_key,
                &hint,
                &workflow2.workflow_id,
                &unlock_err,
                CorrelationId::new(),
            )
            .await;
        assert_eq!(fx.ledger.balance("u-1").unwrap(), 10);
    }
}
