//! Mission assignment and progress.
//!
//! Completion transitions exactly once (optimistic version on the mission
//! document) and the reward credit is idempotent: its key is derived from
//! the mission id, so a redelivered completion event can never pay twice.

use std::sync::Arc;

use chrono::Utc;
use serde_json::to_value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use fabula_bus::EventBus;
use fabula_core::events::{Event, EventPayload, MissionProgressSnapshot};
use fabula_core::types::CorrelationId;
use fabula_ledger::{keys, CurrencyLedger};
use fabula_store::{collections, DocumentStore, StoreError};

use crate::error::{MissionError, Result};
use crate::types::{Mission, MissionKind, MissionStatus, MissionTemplate};

/// Retries when a mission document write races another worker.
const UPDATE_ATTEMPTS: u32 = 3;

pub struct MissionTracker {
    docs: Arc<DocumentStore>,
    ledger: Arc<CurrencyLedger>,
    bus: Arc<EventBus>,
    templates: Vec<MissionTemplate>,
}

impl MissionTracker {
    pub fn new(
        docs: Arc<DocumentStore>,
        ledger: Arc<CurrencyLedger>,
        bus: Arc<EventBus>,
        templates: Vec<MissionTemplate>,
    ) -> Self {
        Self {
            docs,
            ledger,
            bus,
            templates,
        }
    }

    pub fn template(&self, template_id: &str) -> Option<&MissionTemplate> {
        self.templates.iter().find(|t| t.template_id == template_id)
    }

    /// Assign a mission from a template.
    ///
    /// Idempotent per (user, template): when an active instance already
    /// exists it is returned instead of creating a second one.
    #[instrument(skip(self, correlation_id))]
    pub async fn assign(
        &self,
        user_id: &str,
        template_id: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Mission> {
        let template = self
            .template(template_id)
            .ok_or_else(|| MissionError::TemplateNotFound {
                template_id: template_id.to_string(),
            })?
            .clone();

        if let Some(existing) = self
            .active_missions(user_id)?
            .into_iter()
            .find(|m| m.template_id == template_id)
        {
            return Ok(existing);
        }

        let mission = Mission {
            mission_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            template_id: template.template_id.clone(),
            kind: template.kind.clone(),
            progress: MissionProgressSnapshot {
                current: 0,
                target: template.kind.target(),
            },
            reward: template.reward,
            status: MissionStatus::Active,
            assigned_at: Utc::now().to_rfc3339(),
            deadline: None,
        };
        self.docs.insert(
            collections::MISSIONS,
            &mission.mission_id,
            &to_value(&mission)?,
        )?;
        info!(user_id, mission_id = %mission.mission_id, template_id, "mission assigned");

        self.publish(
            correlation_id,
            EventPayload::MissionAssigned {
                user_id: user_id.to_string(),
                mission_id: mission.mission_id.clone(),
                template_id: template.template_id,
            },
        )
        .await;

        Ok(mission)
    }

    /// All active missions for a user.
    pub fn active_missions(&self, user_id: &str) -> Result<Vec<Mission>> {
        let docs = self
            .docs
            .find_by_field(collections::MISSIONS, "$.user_id", user_id)?;
        Ok(docs
            .into_iter()
            .filter_map(|d| serde_json::from_value::<Mission>(d.body).ok())
            .filter(|m| m.status == MissionStatus::Active)
            .collect())
    }

    /// Feed one validated reaction into the user's reaction missions.
    /// Returns the missions completed by this observation.
    pub async fn record_reaction(
        &self,
        user_id: &str,
        channel_id: i64,
        emoji: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Vec<Mission>> {
        self.progress_matching(user_id, correlation_id, |kind| match kind {
            MissionKind::ReactInChannel {
                channel_id: ch,
                emoji: em,
                ..
            } => *ch == channel_id && em == emoji,
            _ => false,
        })
        .await
    }

    /// Feed one narrative choice into the user's choice missions.
    pub async fn record_choice(
        &self,
        user_id: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Vec<Mission>> {
        self.progress_matching(user_id, correlation_id, |kind| {
            matches!(kind, MissionKind::MakeChoices { .. })
        })
        .await
    }

    /// Expire active missions whose deadline has passed.
    pub fn expire_due(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let mut expired = 0;
        for doc in self.docs.list(collections::MISSIONS)? {
            let Ok(mut mission) = serde_json::from_value::<Mission>(doc.body) else {
                continue;
            };
            let due = mission.status == MissionStatus::Active
                && mission.deadline.as_deref().map(|d| d < now.as_str()).unwrap_or(false);
            if !due {
                continue;
            }
            mission.status = MissionStatus::Expired;
            match self.docs.compare_and_put(
                collections::MISSIONS,
                &mission.mission_id,
                doc.version,
                &to_value(&mission)?,
            ) {
                Ok(_) => expired += 1,
                // Lost the race to a progress update; the next sweep decides.
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(expired)
    }

    async fn progress_matching(
        &self,
        user_id: &str,
        correlation_id: Option<CorrelationId>,
        matches: impl Fn(&MissionKind) -> bool,
    ) -> Result<Vec<Mission>> {
        let correlation = correlation_id.unwrap_or_default();
        let mut completed = Vec::new();

        for mission in self.active_missions(user_id)? {
            if !matches(&mission.kind) {
                continue;
            }
            if let Some(mission) = self.advance(&mission.mission_id, &correlation).await? {
                completed.push(mission);
            }
        }
        Ok(completed)
    }

    /// Increment one mission's progress, completing it when the target is
    /// reached. Returns the mission when this call completed it.
    async fn advance(
        &self,
        mission_id: &str,
        correlation: &CorrelationId,
    ) -> Result<Option<Mission>> {
        for _ in 0..UPDATE_ATTEMPTS {
            let Some(doc) = self.docs.get(collections::MISSIONS, mission_id)? else {
                return Err(MissionError::MissionNotFound {
                    mission_id: mission_id.to_string(),
                });
            };
            let mut mission: Mission = serde_json::from_value(doc.body)?;
            if mission.status != MissionStatus::Active {
                // Already completed or expired elsewhere; nothing to do.
                return Ok(None);
            }

            mission.progress.current += 1;
            let now_complete = mission.is_complete();
            if now_complete {
                mission.status = MissionStatus::Completed;
            }

            match self.docs.compare_and_put(
                collections::MISSIONS,
                mission_id,
                doc.version,
                &to_value(&mission)?,
            ) {
                Ok(_) => {
                    self.publish(
                        Some(correlation.clone()),
                        EventPayload::MissionProgress {
                            user_id: mission.user_id.clone(),
                            mission_id: mission.mission_id.clone(),
                            progress: mission.progress,
                        },
                    )
                    .await;

                    if now_complete {
                        info!(
                            mission_id = %mission.mission_id,
                            user_id = %mission.user_id,
                            reward = mission.reward,
                            "mission completed"
                        );
                        self.publish(
                            Some(correlation.clone()),
                            EventPayload::MissionCompleted {
                                user_id: mission.user_id.clone(),
                                mission_id: mission.mission_id.clone(),
                                reward: mission.reward,
                            },
                        )
                        .await;

                        // Reward dispatch is idempotent on the mission id, so
                        // a redelivered completion can never double-pay.
                        self.ledger
                            .credit(
                                &mission.user_id,
                                mission.reward,
                                "mission_reward",
                                &keys::derive(&["mission", &mission.mission_id]),
                                Some(correlation.clone()),
                            )
                            .await?;
                        return Ok(Some(mission));
                    }
                    return Ok(None);
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        warn!(mission_id, "mission update contended, giving up this delivery");
        Ok(None)
    }

    async fn publish(&self, correlation_id: Option<CorrelationId>, payload: EventPayload) {
        let event = Event::new("missions", correlation_id, payload);
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "mission event could not be published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_bus::{LocalReplayQueue, MemoryTransport};
    use fabula_users::UserState;

    const CHANNEL: i64 = -100200300;

    fn fixture() -> (MissionTracker, Arc<CurrencyLedger>, Arc<DocumentStore>) {
        let docs = Arc::new(DocumentStore::open_in_memory().unwrap());
        let dir = std::env::temp_dir().join(format!("fabula-test-{}", Uuid::new_v4()));
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
        let tracker = MissionTracker::new(
            Arc::clone(&docs),
            Arc::clone(&ledger),
            bus,
            vec![MissionTemplate::reaction_in_main_channel(CHANNEL, "❤")],
        );
        (tracker, ledger, docs)
    }

    #[tokio::test]
    async fn assignment_is_idempotent_per_template() {
        let (tracker, _ledger, _docs) = fixture();
        let first = tracker
            .assign("u-1", "reaction_in_main_channel", None)
            .await
            .unwrap();
        let second = tracker
            .assign("u-1", "reaction_in_main_channel", None)
            .await
            .unwrap();
        assert_eq!(first.mission_id, second.mission_id);
        assert_eq!(tracker.active_missions("u-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_template_is_rejected() {
        let (tracker, _ledger, _docs) = fixture();
        let err = tracker.assign("u-1", "nonexistent", None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn matching_reaction_completes_and_pays_once() {
        let (tracker, ledger, _docs) = fixture();
        tracker
            .assign("u-1", "reaction_in_main_channel", None)
            .await
            .unwrap();

        let completed = tracker
            .record_reaction("u-1", CHANNEL, "❤", None)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(ledger.balance("u-1").unwrap(), 10);

        // Redelivery of the same observation: mission is no longer active,
        // so nothing progresses and nothing is paid again.
        let again = tracker
            .record_reaction("u-1", CHANNEL, "❤", None)
            .await
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(ledger.balance("u-1").unwrap(), 10);
    }

    #[tokio::test]
    async fn non_matching_reaction_does_not_progress() {
        let (tracker, ledger, _docs) = fixture();
        tracker
            .assign("u-1", "reaction_in_main_channel", None)
            .await
            .unwrap();

        let completed = tracker
            .record_reaction("u-1", CHANNEL, "🔥", None)
            .await
            .unwrap();
        assert!(completed.is_empty());
        assert_eq!(ledger.balance("u-1").unwrap(), 0);
        assert_eq!(tracker.active_missions("u-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deadline_sweep_expires_missions() {
        let (tracker, _ledger, docs) = fixture();
        let mission = tracker
            .assign("u-1", "reaction_in_main_channel", None)
            .await
            .unwrap();

        // Backdate the deadline directly in the store.
        let doc = docs.get(collections::MISSIONS, &mission.mission_id).unwrap().unwrap();
        let mut m: Mission = serde_json::from_value(doc.body).unwrap();
        m.deadline = Some("2020-01-01T00:00:00+00:00".into());
        docs.compare_and_put(
            collections::MISSIONS,
            &mission.mission_id,
            doc.version,
            &to_value(&m).unwrap(),
        )
        .unwrap();

        assert_eq!(tracker.expire_due().unwrap(), 1);
        assert!(tracker.active_missions("u-1").unwrap().is_empty());
    }
}
