//! Fragment retrieval and choice processing.
//!
//! VIP gating happens at use time: every delivery of a vip_required fragment
//! consults the subscription as it stands now, so an expiry cuts access
//! immediately. Choice effects commit in one document transaction; the
//! currency reward is dispatched through the ledger after the commit with a
//! choice-derived idempotency key.

use std::sync::Arc;

use chrono::Utc;
use serde_json::to_value;
use tracing::{info, instrument, warn};

use fabula_bus::EventBus;
use fabula_core::events::{Event, EventPayload};
use fabula_core::types::CorrelationId;
use fabula_ledger::{keys, CurrencyLedger};
use fabula_store::{collections, DocumentStore, StoreError};
use fabula_users::{
    Access, AccessPolicy, ChoiceRecord, Resource, SubscriptionManager, UserRegistry, UserState,
    UserView,
};

use crate::error::{NarrativeError, Result};
use crate::types::{Fragment, Rewards};

/// Where a brand-new user's story begins.
pub const ENTRY_FRAGMENT: &str = "intro_1";

/// What a committed choice produced.
#[derive(Debug, Clone)]
pub struct ChoiceOutcome {
    pub next_fragment_id: Option<String>,
    pub rewards: Rewards,
}

enum ChoiceTxn {
    Applied {
        old_fragment: String,
        next_fragment: Option<String>,
        rewards: Rewards,
    },
    Rejected(NarrativeError),
}

pub struct NarrativeEngine {
    docs: Arc<DocumentStore>,
    ledger: Arc<CurrencyLedger>,
    bus: Arc<EventBus>,
    registry: Arc<UserRegistry>,
    subscriptions: Arc<SubscriptionManager>,
}

impl NarrativeEngine {
    pub fn new(
        docs: Arc<DocumentStore>,
        ledger: Arc<CurrencyLedger>,
        bus: Arc<EventBus>,
        registry: Arc<UserRegistry>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            docs,
            ledger,
            bus,
            registry,
            subscriptions,
        }
    }

    /// Load a fragment definition without gating (content lookups).
    pub fn fragment(&self, fragment_id: &str) -> Result<Fragment> {
        let doc = self
            .docs
            .get(collections::NARRATIVE_FRAGMENTS, fragment_id)?
            .ok_or_else(|| NarrativeError::FragmentNotFound {
                fragment_id: fragment_id.to_string(),
            })?;
        Ok(serde_json::from_value(doc.body)?)
    }

    /// Deliver a fragment to a user, enforcing the VIP gate at use time.
    #[instrument(skip(self, correlation_id), fields(user_id, fragment_id))]
    pub async fn deliver(
        &self,
        user_id: &str,
        fragment_id: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Fragment> {
        let fragment = self.fragment(fragment_id)?;
        let correlation = correlation_id.unwrap_or_default();

        if fragment.vip_required {
            let user = match self.registry.get(user_id)? {
                UserView::Complete(user) => user,
                UserView::Partial { .. } => {
                    return Err(NarrativeError::UserStateMissing {
                        user_id: user_id.to_string(),
                    })
                }
            };
            let vip_active = self.subscriptions.vip_active(user_id)?;
            let resource = Resource::named(fragment_id).vip();
            match AccessPolicy::evaluate(user.profile.role, vip_active, &user.state, &resource) {
                Access::Allow => {
                    self.publish(
                        Some(correlation.clone()),
                        EventPayload::VipAccessGranted {
                            user_id: user_id.to_string(),
                            resource: fragment_id.to_string(),
                        },
                    )
                    .await;
                }
                Access::Deny(reason) => {
                    self.publish(
                        Some(correlation),
                        EventPayload::VipAccessDenied {
                            user_id: user_id.to_string(),
                            resource: fragment_id.to_string(),
                            reason: reason.code().to_string(),
                        },
                    )
                    .await;
                    return Err(NarrativeError::AccessDenied { reason });
                }
            }
        }

        self.publish(
            Some(correlation),
            EventPayload::NarrativeFragmentDelivered {
                user_id: user_id.to_string(),
                fragment_id: fragment_id.to_string(),
            },
        )
        .await;
        Ok(fragment)
    }

    /// The user's current fragment, entering the story at the start when
    /// they have none yet.
    pub fn current_fragment_id(&self, state: &UserState) -> String {
        state
            .current_fragment_id
            .clone()
            .unwrap_or_else(|| ENTRY_FRAGMENT.to_string())
    }

    /// Process a narrative choice.
    ///
    /// Preconditions: the fragment must be the user's current one, the
    /// choice must exist on it, and the choice's own gates must pass. All
    /// state effects commit in one document transaction; the reward credit
    /// follows the commit.
    #[instrument(skip(self, correlation_id), fields(user_id, fragment_id, choice_id))]
    pub async fn process_choice(
        &self,
        user_id: &str,
        fragment_id: &str,
        choice_id: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<ChoiceOutcome> {
        let fragment = self.fragment(fragment_id)?;
        let correlation = correlation_id.unwrap_or_default();

        // The fragment-level VIP gate also applies to acting on it.
        if fragment.vip_required && !self.subscriptions.vip_active(user_id)? {
            let role = match self.registry.get(user_id)? {
                UserView::Complete(user) => user.profile.role,
                UserView::Partial { .. } => Default::default(),
            };
            if !role.is_admin() {
                self.publish(
                    Some(correlation),
                    EventPayload::VipAccessDenied {
                        user_id: user_id.to_string(),
                        resource: fragment_id.to_string(),
                        reason: "vip_required".to_string(),
                    },
                )
                .await;
                return Err(NarrativeError::AccessDenied {
                    reason: fabula_users::DenyReason::VipRequired,
                });
            }
        }

        let outcome = self.docs.txn(|tx| {
            let user_doc = tx.get(collections::USERS, user_id)?.ok_or_else(|| {
                StoreError::NotFound {
                    collection: collections::USERS.to_string(),
                    id: user_id.to_string(),
                }
            })?;
            let mut state: UserState =
                serde_json::from_value(user_doc.body).map_err(StoreError::Serialization)?;

            // A choice only counts against the user's current fragment. New
            // users are implicitly standing at the entry fragment.
            let current = state
                .current_fragment_id
                .clone()
                .unwrap_or_else(|| ENTRY_FRAGMENT.to_string());
            if current != fragment_id {
                return Ok(ChoiceTxn::Rejected(NarrativeError::InvalidChoice {
                    detail: format!("fragment {} is not the current fragment", fragment_id),
                }));
            }

            let Some(choice) = fragment.choice(choice_id) else {
                return Ok(ChoiceTxn::Rejected(NarrativeError::InvalidChoice {
                    detail: format!("choice {} not in fragment {}", choice_id, fragment_id),
                }));
            };

            let pre = &choice.preconditions;
            if let Some(min) = pre.min_level {
                if state.narrative_level < min {
                    return Ok(ChoiceTxn::Rejected(NarrativeError::InvalidChoice {
                        detail: format!("requires narrative level {}", min),
                    }));
                }
            }
            if let Some(hint) = pre.required_hints.iter().find(|h| !state.has_hint(h)) {
                return Ok(ChoiceTxn::Rejected(NarrativeError::InvalidChoice {
                    detail: format!("requires hint {}", hint),
                }));
            }
            if let Some(item) = pre.required_items.iter().find(|i| !state.has_item(i)) {
                return Ok(ChoiceTxn::Rejected(NarrativeError::InvalidChoice {
                    detail: format!("requires item {}", item),
                }));
            }

            state.choices_log.push(ChoiceRecord {
                fragment_id: fragment_id.to_string(),
                choice_id: choice_id.to_string(),
                chosen_at: Utc::now().to_rfc3339(),
            });
            if !state.completed_fragments.iter().any(|f| f == fragment_id) {
                state.completed_fragments.push(fragment_id.to_string());
            }
            state.current_fragment_id = choice.next_fragment_id.clone();

            for hint in &choice.rewards.hints {
                if !state.has_hint(hint) {
                    state.unlocked_hints.push(hint.clone());
                }
            }
            for item in &choice.rewards.items {
                if !state.has_item(item) {
                    state.items.push(item.clone());
                }
            }

            tx.compare_and_put(
                collections::USERS,
                user_id,
                user_doc.version,
                &to_value(&state).map_err(StoreError::Serialization)?,
            )?;

            Ok(ChoiceTxn::Applied {
                old_fragment: current,
                next_fragment: choice.next_fragment_id.clone(),
                rewards: choice.rewards.clone(),
            })
        })?;

        match outcome {
            ChoiceTxn::Rejected(err) => Err(err),
            ChoiceTxn::Applied {
                old_fragment,
                next_fragment,
                rewards,
            } => {
                info!(user_id, fragment_id, choice_id, "narrative choice committed");
                self.publish(
                    Some(correlation.clone()),
                    EventPayload::NarrativeChoiceMade {
                        user_id: user_id.to_string(),
                        fragment_id: fragment_id.to_string(),
                        choice_id: choice_id.to_string(),
                    },
                )
                .await;

                for hint in &rewards.hints {
                    self.publish(
                        Some(correlation.clone()),
                        EventPayload::HintUnlocked {
                            user_id: user_id.to_string(),
                            hint_id: hint.clone(),
                        },
                    )
                    .await;
                }

                if let Some(amount) = rewards.currency {
                    // Keyed on the (user, fragment, choice) triple: replaying
                    // the same choice event can never double-pay.
                    let key = keys::derive(&[user_id, &old_fragment, choice_id]);
                    self.ledger
                        .credit(user_id, amount, "choice_reward", &key, Some(correlation))
                        .await?;
                }

                Ok(ChoiceOutcome {
                    next_fragment_id: next_fragment,
                    rewards,
                })
            }
        }
    }

    async fn publish(&self, correlation_id: Option<CorrelationId>, payload: EventPayload) {
        let event = Event::new("narrative", correlation_id, payload);
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "narrative event could not be published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_bus::{LocalReplayQueue, MemoryTransport};
    use fabula_core::types::Plan;
    use fabula_store::{AdminLog, DualStoreManager};
    use fabula_users::ExternalUser;

    use crate::types::{Choice, Preconditions};

    struct Fixture {
        engine: NarrativeEngine,
        ledger: Arc<CurrencyLedger>,
        registry: Arc<UserRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        docs: Arc<DocumentStore>,
    }

    async fn fixture() -> (Fixture, String) {
        let mgr = DualStoreManager::in_memory().unwrap();
        let docs = mgr.documents();
        let dir = std::env::temp_dir().join(format!("fabula-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let (bus, _dlq) = EventBus::new(
            Arc::new(MemoryTransport::new()),
            LocalReplayQueue::open(dir.join("replay.jsonl"), 100).unwrap(),
        );
        let audit = AdminLog::new(Arc::clone(&docs));
        let registry = Arc::new(
            UserRegistry::new(
                mgr.open_relational().unwrap(),
                Arc::clone(&docs),
                Arc::clone(&bus),
                audit,
            )
            .unwrap(),
        );
        let subscriptions = Arc::new(
            SubscriptionManager::new(mgr.open_relational().unwrap(), Arc::clone(&bus)).unwrap(),
        );
        let ledger = Arc::new(CurrencyLedger::new(Arc::clone(&docs), Arc::clone(&bus)));
        let engine = NarrativeEngine::new(
            Arc::clone(&docs),
            Arc::clone(&ledger),
            bus,
            Arc::clone(&registry),
            Arc::clone(&subscriptions),
        );

        let user = registry
            .create(ExternalUser {
                external_id: 1,
                display_name: "tester".into(),
                language: "es".into(),
            })
            .await
            .unwrap();

        seed_fragments(&docs);
        (
            Fixture {
                engine,
                ledger,
                registry,
                subscriptions,
                docs,
            },
            user.profile.internal_id,
        )
    }

    fn seed_fragments(docs: &DocumentStore) {
        let intro = Fragment {
            fragment_id: ENTRY_FRAGMENT.into(),
            title: "El umbral".into(),
            body: "Una puerta entreabierta.".into(),
            choices: vec![
                Choice {
                    choice_id: "entrar".into(),
                    label: "Entrar".into(),
                    next_fragment_id: Some("sala_2".into()),
                    preconditions: Preconditions::default(),
                    rewards: Rewards {
                        currency: Some(5),
                        items: vec![],
                        hints: vec!["pista_inicial".into()],
                    },
                },
                Choice {
                    choice_id: "esperar".into(),
                    label: "Esperar".into(),
                    next_fragment_id: None,
                    preconditions: Preconditions {
                        min_level: Some(3),
                        ..Default::default()
                    },
                    rewards: Rewards::default(),
                },
            ],
            vip_required: false,
            tags: vec![],
        };
        let vip_room = Fragment {
            fragment_id: "divan_1".into(),
            title: "El Diván".into(),
            body: "Solo para invitados.".into(),
            choices: vec![],
            vip_required: true,
            tags: vec!["vip".into()],
        };
        let sala = Fragment {
            fragment_id: "sala_2".into(),
            title: "La sala".into(),
            body: "Continúa.".into(),
            choices: vec![],
            vip_required: false,
            tags: vec![],
        };
        for frag in [intro, vip_room, sala] {
            docs.insert(
                collections::NARRATIVE_FRAGMENTS,
                &frag.fragment_id.clone(),
                &to_value(&frag).unwrap(),
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn choice_moves_progression_and_pays_reward() {
        let (fx, user_id) = fixture().await;
        let outcome = fx
            .engine
            .process_choice(&user_id, ENTRY_FRAGMENT, "entrar", None)
            .await
            .unwrap();
        assert_eq!(outcome.next_fragment_id.as_deref(), Some("sala_2"));

        let state = fx.registry.load_state(&user_id).unwrap().unwrap();
        assert_eq!(state.current_fragment_id.as_deref(), Some("sala_2"));
        assert!(state.completed_fragments.contains(&ENTRY_FRAGMENT.to_string()));
        assert!(state.has_hint("pista_inicial"));
        assert_eq!(state.choices_log.len(), 1);
        assert_eq!(fx.ledger.balance(&user_id).unwrap(), 5);
    }

    #[tokio::test]
    async fn choice_on_wrong_fragment_is_invalid() {
        let (fx, user_id) = fixture().await;
        let err = fx
            .engine
            .process_choice(&user_id, "sala_2", "whatever", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CHOICE");
        // Nothing committed.
        let state = fx.registry.load_state(&user_id).unwrap().unwrap();
        assert!(state.choices_log.is_empty());
    }

    #[tokio::test]
    async fn unmet_precondition_is_invalid() {
        let (fx, user_id) = fixture().await;
        let err = fx
            .engine
            .process_choice(&user_id, ENTRY_FRAGMENT, "esperar", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CHOICE");
    }

    #[tokio::test]
    async fn unknown_choice_is_invalid() {
        let (fx, user_id) = fixture().await;
        let err = fx
            .engine
            .process_choice(&user_id, ENTRY_FRAGMENT, "volar", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CHOICE");
    }

    #[tokio::test]
    async fn vip_fragment_denied_without_subscription() {
        let (fx, user_id) = fixture().await;
        let err = fx.engine.deliver(&user_id, "divan_1", None).await.unwrap_err();
        assert_eq!(err.code(), "ACCESS_DENIED");
    }

    #[tokio::test]
    async fn vip_fragment_delivered_with_active_subscription() {
        let (fx, user_id) = fixture().await;
        fx.subscriptions
            .activate(&user_id, Plan::Vip, None)
            .await
            .unwrap();
        let fragment = fx.engine.deliver(&user_id, "divan_1", None).await.unwrap();
        assert_eq!(fragment.fragment_id, "divan_1");
    }

    #[tokio::test]
    async fn expired_subscription_denies_immediately() {
        let (fx, user_id) = fixture().await;
        fx.subscriptions
            .activate(&user_id, Plan::Vip, Some("2020-01-01T00:00:00+00:00".into()))
            .await
            .unwrap();
        // No sweep has run; the use-time check already refuses.
        let err = fx.engine.deliver(&user_id, "divan_1", None).await.unwrap_err();
        assert_eq!(err.code(), "ACCESS_DENIED");
    }

    #[tokio::test]
    async fn replayed_choice_reward_does_not_double_pay() {
        let (fx, user_id) = fixture().await;
        fx.engine
            .process_choice(&user_id, ENTRY_FRAGMENT, "entrar", None)
            .await
            .unwrap();

        // Manually put the user back on the entry fragment, as a redelivered
        // command would find them mid-retry.
        let doc = fx.docs.get(collections::USERS, &user_id).unwrap().unwrap();
        let mut state: UserState = serde_json::from_value(doc.body).unwrap();
        state.current_fragment_id = Some(ENTRY_FRAGMENT.into());
        fx.docs
            .compare_and_put(collections::USERS, &user_id, doc.version, &to_value(&state).unwrap())
            .unwrap();

        fx.engine
            .process_choice(&user_id, ENTRY_FRAGMENT, "entrar", None)
            .await
            .unwrap();
        // Same idempotency key: the second credit replays, balance stays 5.
        assert_eq!(fx.ledger.balance(&user_id).unwrap(), 5);
    }

    #[tokio::test]
    async fn missing_fragment_is_not_found() {
        let (fx, user_id) = fixture().await;
        let err = fx.engine.deliver(&user_id, "no_such", None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
