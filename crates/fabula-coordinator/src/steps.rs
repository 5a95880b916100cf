//! Coordinator steps: the dispatch table's entries.
//!
//! Each step declares the event types it reacts to and applies one
//! idempotent effect. The table is populated once at startup; unknown event
//! types never reach a step.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::to_value;
use tracing::{info, warn};

use fabula_bus::EventBus;
use fabula_core::events::{Event, EventPayload};
use fabula_core::types::CorrelationId;
use fabula_ledger::{keys, CurrencyLedger};
use fabula_missions::MissionTracker;
use fabula_narrative::Hint;
use fabula_store::{collections, DocumentStore, StoreError};
use fabula_users::UserState;

#[async_trait]
pub trait CoordinatorStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event types this step reacts to.
    fn event_types(&self) -> &'static [&'static str];

    /// Apply the step's effect. Must be idempotent: the same event can be
    /// delivered (and therefore applied) more than once.
    async fn apply(&self, event: &Event, payload: &EventPayload) -> Result<(), String>;
}

fn correlation_of(event: &Event) -> Option<CorrelationId> {
    Some(CorrelationId::from(event.correlation_id.clone()))
}

/// Feeds validated reactions and narrative choices into mission progress.
pub struct MissionProgressStep {
    pub tracker: Arc<MissionTracker>,
}

#[async_trait]
impl CoordinatorStep for MissionProgressStep {
    fn name(&self) -> &'static str {
        "mission_progress"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &["reaction_observed", "narrative_choice_made"]
    }

    async fn apply(&self, event: &Event, payload: &EventPayload) -> Result<(), String> {
        match payload {
            EventPayload::ReactionObserved {
                user_id,
                channel_id,
                emoji,
                ..
            } => {
                self.tracker
                    .record_reaction(user_id, *channel_id, emoji, correlation_of(event))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(())
            }
            EventPayload::NarrativeChoiceMade { user_id, .. } => {
                self.tracker
                    .record_choice(user_id, correlation_of(event))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Guarantees the reward credit for a completed mission even when the
/// tracker crashed between publishing and crediting. The mission-derived
/// idempotency key collapses the duplicate into a replay.
pub struct RewardDispatchStep {
    pub ledger: Arc<CurrencyLedger>,
}

#[async_trait]
impl CoordinatorStep for RewardDispatchStep {
    fn name(&self) -> &'static str {
        "reward_dispatch"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &["mission_completed"]
    }

    async fn apply(&self, event: &Event, payload: &EventPayload) -> Result<(), String> {
        let EventPayload::MissionCompleted {
            user_id,
            mission_id,
            reward,
        } = payload
        else {
            return Ok(());
        };
        self.ledger
            .credit(
                user_id,
                *reward,
                "mission_reward",
                &keys::derive(&["mission", mission_id]),
                correlation_of(event),
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Applies level promotions carried by unlocked hints.
///
/// The shop promotes synchronously on purchase; this step covers hints
/// granted through narrative rewards, which can arrive at any point relative
/// to mission completion. The promotion guard (level < target, re-checked
/// under the version token) is what makes the emission exactly-once: a
/// redelivered unlock, or an unlock the shop already applied, finds the
/// level at target and does nothing.
pub struct LevelProgressionStep {
    pub docs: Arc<DocumentStore>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl CoordinatorStep for LevelProgressionStep {
    fn name(&self) -> &'static str {
        "level_progression"
    }

    fn event_types(&self) -> &'static [&'static str] {
        &["hint_unlocked"]
    }

    async fn apply(&self, event: &Event, payload: &EventPayload) -> Result<(), String> {
        let EventPayload::HintUnlocked { user_id, hint_id } = payload else {
            return Ok(());
        };

        let Some(hint_doc) = self
            .docs
            .get(collections::HINTS, hint_id)
            .map_err(|e| e.to_string())?
        else {
            // Hints granted inline by content may have no catalogue entry.
            return Ok(());
        };
        let hint: Hint = serde_json::from_value(hint_doc.body).map_err(|e| e.to_string())?;
        let Some(target) = hint.unlocks.level_promotion else {
            return Ok(());
        };

        // CAS loop: the promotion applies at most once because the guard
        // re-checks the level on every attempt.
        for _ in 0..3 {
            let Some(doc) = self
                .docs
                .get(collections::USERS, user_id)
                .map_err(|e| e.to_string())?
            else {
                warn!(user_id, "level progression for unknown user");
                return Ok(());
            };
            let mut state: UserState =
                serde_json::from_value(doc.body).map_err(|e| e.to_string())?;
            if state.narrative_level >= target {
                return Ok(());
            }
            let old_level = state.narrative_level;
            state.narrative_level = target;

            match self.docs.compare_and_put(
                collections::USERS,
                user_id,
                doc.version,
                &to_value(&state).map_err(|e| e.to_string())?,
            ) {
                Ok(_) => {
                    info!(user_id, old_level, new_level = target, "narrative level promoted");
                    let out = Event::new(
                        "coordinator",
                        correlation_of(event),
                        EventPayload::NarrativeLevelChanged {
                            user_id: user_id.clone(),
                            old_level,
                            new_level: target,
                            trigger: "hint".to_string(),
                        },
                    );
                    if let Err(e) = self.bus.publish(out).await {
                        warn!(error = %e, "level change event could not be published");
                    }
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.to_string()),
            }
        }
        Err("level promotion contended".to_string())
    }
}
