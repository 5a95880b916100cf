//! Subscription lifecycle: one active subscription per user, transitions
//! restricted to the legal DAG, periodic expiry sweep.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{info, instrument, warn};

use fabula_bus::EventBus;
use fabula_core::events::{Event, EventPayload};
use fabula_core::types::{Plan, SubscriptionStatus};
use uuid::Uuid;

use crate::db::{self, row_to_subscription, SUBSCRIPTION_COLUMNS};
use crate::error::{Result, UserError};
use crate::types::Subscription;

pub struct SubscriptionManager {
    rel: Mutex<Connection>,
    bus: Arc<EventBus>,
}

impl SubscriptionManager {
    pub fn new(rel: Connection, bus: Arc<EventBus>) -> Result<Self> {
        db::init_db(&rel)?;
        Ok(Self {
            rel: Mutex::new(rel),
            bus,
        })
    }

    /// Activate a subscription for `user_id`.
    ///
    /// An existing active subscription is cancelled first (a legal edge), so
    /// at most one active row per user exists at every commit boundary.
    #[instrument(skip(self))]
    pub async fn activate(
        &self,
        user_id: &str,
        plan: Plan,
        end_at: Option<String>,
    ) -> Result<Subscription> {
        let subscription = {
            let conn = self.rel.lock().unwrap();

            if let Some(current) = query_active(&conn, user_id)? {
                transition(&conn, &current, SubscriptionStatus::Cancelled)?;
                info!(user_id, prior = %current.id, "prior active subscription cancelled");
            }

            let subscription = Subscription {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                plan,
                status: SubscriptionStatus::Active,
                start_at: Utc::now().to_rfc3339(),
                end_at,
            };
            conn.execute(
                "INSERT INTO subscriptions (id, user_id, plan, status, start_at, end_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5)",
                params![
                    subscription.id,
                    subscription.user_id,
                    subscription.plan.to_string(),
                    subscription.start_at,
                    subscription.end_at,
                ],
            )?;
            subscription
        };

        info!(user_id, plan = %plan, "subscription activated");
        self.publish(EventPayload::SubscriptionActivated {
            user_id: user_id.to_string(),
            plan,
            until: subscription.end_at.clone(),
        })
        .await;

        Ok(subscription)
    }

    /// The user's active subscription, if any.
    pub fn active(&self, user_id: &str) -> Result<Option<Subscription>> {
        let conn = self.rel.lock().unwrap();
        query_active(&conn, user_id)
    }

    /// Whether the user holds an active, unexpired VIP subscription right
    /// now. Checked at use time so an expiry takes effect immediately, even
    /// before the sweep has run.
    pub fn vip_active(&self, user_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        Ok(self
            .active(user_id)?
            .map(|s| s.plan == Plan::Vip && s.end_at.as_deref().map(|e| e > now.as_str()).unwrap_or(true))
            .unwrap_or(false))
    }

    /// Apply a status transition, rejecting edges outside the DAG.
    pub fn set_status(&self, subscription_id: &str, next: SubscriptionStatus) -> Result<()> {
        let conn = self.rel.lock().unwrap();
        let current = query_by_id(&conn, subscription_id)?.ok_or_else(|| {
            UserError::SubscriptionNotFound {
                id: subscription_id.to_string(),
            }
        })?;
        transition(&conn, &current, next)
    }

    /// Expire every active subscription whose end has passed. Returns the
    /// expired subscriptions so callers can fan out events.
    #[instrument(skip(self))]
    pub async fn expire_due(&self) -> Result<usize> {
        let due: Vec<Subscription> = {
            let conn = self.rel.lock().unwrap();
            let now = Utc::now().to_rfc3339();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM subscriptions
                 WHERE status = 'active' AND end_at IS NOT NULL AND end_at < ?1",
                SUBSCRIPTION_COLUMNS
            ))?;
            let rows: Vec<Subscription> = stmt
                .query_map(params![now], row_to_subscription)?
                .filter_map(|r| r.ok())
                .collect();

            for sub in &rows {
                transition(&conn, sub, SubscriptionStatus::Expired)?;
            }
            rows
        };

        for sub in &due {
            info!(user_id = %sub.user_id, subscription = %sub.id, "subscription expired");
            self.publish(EventPayload::SubscriptionExpired {
                user_id: sub.user_id.clone(),
                plan: sub.plan,
                until: sub.end_at.clone(),
            })
            .await;
        }
        Ok(due.len())
    }

    async fn publish(&self, payload: EventPayload) {
        let event = Event::new("subscriptions", None, payload);
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "subscription event could not be published");
        }
    }
}

fn query_active(conn: &Connection, user_id: &str) -> Result<Option<Subscription>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM subscriptions WHERE user_id = ?1 AND status = 'active'",
        SUBSCRIPTION_COLUMNS
    ))?;
    match stmt.query_row(params![user_id], row_to_subscription) {
        Ok(s) => Ok(Some(s)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn query_by_id(conn: &Connection, id: &str) -> Result<Option<Subscription>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM subscriptions WHERE id = ?1",
        SUBSCRIPTION_COLUMNS
    ))?;
    match stmt.query_row(params![id], row_to_subscription) {
        Ok(s) => Ok(Some(s)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn transition(conn: &Connection, current: &Subscription, next: SubscriptionStatus) -> Result<()> {
    if !current.status.can_transition_to(next) {
        return Err(UserError::InvalidTransition {
            from: current.status.to_string(),
            to: next.to_string(),
        });
    }
    conn.execute(
        "UPDATE subscriptions SET status = ?2 WHERE id = ?1",
        params![current.id, next.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_bus::{LocalReplayQueue, MemoryTransport};
    use fabula_store::DualStoreManager;

    fn fixture() -> (SubscriptionManager, DualStoreManager) {
        let mgr = DualStoreManager::in_memory().unwrap();
        let dir = std::env::temp_dir().join(format!("fabula-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let (bus, _dlq) = EventBus::new(
            Arc::new(MemoryTransport::new()),
            LocalReplayQueue::open(dir.join("replay.jsonl"), 100).unwrap(),
        );
        let conn = mgr.open_relational().unwrap();
        // Subscriptions reference profiles; create the referenced row.
        db::init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO user_profiles
             (internal_id, external_id, display_name, language, created_at, last_seen_at, active, role)
             VALUES ('u-1', 1, 'tester', 'es', '2026-01-01', '2026-01-01', 1, 'free')",
            [],
        )
        .unwrap();
        let subs = SubscriptionManager::new(mgr.open_relational().unwrap(), bus).unwrap();
        (subs, mgr)
    }

    #[tokio::test]
    async fn activation_keeps_single_active_row() {
        let (subs, _mgr) = fixture();
        let first = subs.activate("u-1", Plan::Premium, None).await.unwrap();
        let second = subs.activate("u-1", Plan::Vip, None).await.unwrap();

        let active = subs.active("u-1").unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_ne!(first.id, second.id);
        assert!(subs.vip_active("u-1").unwrap());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let (subs, _mgr) = fixture();
        let sub = subs.activate("u-1", Plan::Vip, None).await.unwrap();

        subs.set_status(&sub.id, SubscriptionStatus::Cancelled).unwrap();
        let err = subs
            .set_status(&sub.id, SubscriptionStatus::Active)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn past_end_date_is_not_vip_even_before_sweep() {
        let (subs, _mgr) = fixture();
        subs.activate("u-1", Plan::Vip, Some("2020-01-01T00:00:00+00:00".into()))
            .await
            .unwrap();
        assert!(!subs.vip_active("u-1").unwrap());
    }

    #[tokio::test]
    async fn sweep_expires_due_subscriptions() {
        let (subs, _mgr) = fixture();
        let sub = subs
            .activate("u-1", Plan::Vip, Some("2020-01-01T00:00:00+00:00".into()))
            .await
            .unwrap();

        let expired = subs.expire_due().await.unwrap();
        assert_eq!(expired, 1);
        assert!(subs.active("u-1").unwrap().is_none());

        // Expired is terminal.
        let err = subs
            .set_status(&sub.id, SubscriptionStatus::Active)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }
}
