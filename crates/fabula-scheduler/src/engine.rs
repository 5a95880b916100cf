//! Scheduler engine: drives scheduled posts at ±1 s precision and runs the
//! minute-cadence expiry sweeps.
//!
//! Publication itself goes through the bus (`post_published`); the chat
//! layer subscribes and performs the actual send. That indirection keeps
//! this crate free of any transport dependency.

use std::sync::Arc;

use chrono::Utc;
use serde_json::to_value;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use fabula_bus::EventBus;
use fabula_core::events::{Event, EventPayload};
use fabula_missions::MissionTracker;
use fabula_store::{collections, DocumentStore, StoreError};
use fabula_users::SubscriptionManager;

use crate::error::Result;
use crate::types::{PostStatus, ScheduledPost};

/// Posts older than this at startup are marked failed instead of sent.
const MISSED_GRACE_SECS: i64 = 3600;
/// Expiry sweeps run every this many ticks (ticks are 1 s).
const SWEEP_EVERY_TICKS: u64 = 60;

pub struct SchedulerEngine {
    docs: Arc<DocumentStore>,
    bus: Arc<EventBus>,
    subscriptions: Arc<SubscriptionManager>,
    tracker: Arc<MissionTracker>,
}

impl SchedulerEngine {
    pub fn new(
        docs: Arc<DocumentStore>,
        bus: Arc<EventBus>,
        subscriptions: Arc<SubscriptionManager>,
        tracker: Arc<MissionTracker>,
    ) -> Self {
        Self {
            docs,
            bus,
            subscriptions,
            tracker,
        }
    }

    /// Queue a post for publication. Returns the stored record.
    pub async fn schedule_post(
        &self,
        channel_id: i64,
        body: &str,
        publish_at: &str,
    ) -> Result<ScheduledPost> {
        let post = ScheduledPost {
            post_id: Uuid::new_v4().to_string(),
            channel_id,
            body: body.to_string(),
            publish_at: publish_at.to_string(),
            status: PostStatus::Pending,
            created_at: Utc::now().to_rfc3339(),
            published_at: None,
        };
        self.docs
            .insert(collections::SCHEDULED_POSTS, &post.post_id, &to_value(&post)?)?;
        info!(post_id = %post.post_id, channel_id, publish_at, "post scheduled");

        self.publish(EventPayload::PostScheduled {
            post_id: post.post_id.clone(),
            channel_id,
            publish_at: publish_at.to_string(),
        })
        .await;
        Ok(post)
    }

    pub fn list_posts(&self) -> Result<Vec<ScheduledPost>> {
        Ok(self
            .docs
            .list(collections::SCHEDULED_POSTS)?
            .into_iter()
            .filter_map(|d| serde_json::from_value(d.body).ok())
            .collect())
    }

    /// Main loop. Polls every second until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        if let Err(e) = self.mark_missed_on_startup() {
            error!(error = %e, "missed-post sweep failed on startup");
        }

        let mut ticks: u64 = 0;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ticks += 1;
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick error");
                    }
                    if ticks % SWEEP_EVERY_TICKS == 0 {
                        self.sweep().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Publish every due pending post exactly once.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let pending = self
            .docs
            .find_by_field(collections::SCHEDULED_POSTS, "$.status", "pending")?;

        for doc in pending {
            let Ok(mut post) = serde_json::from_value::<ScheduledPost>(doc.body) else {
                continue;
            };
            if post.publish_at > now {
                continue;
            }

            post.status = PostStatus::Published;
            post.published_at = Some(now.clone());
            // The version guard makes the transition single-winner even if
            // two engine instances race.
            match self.docs.compare_and_put(
                collections::SCHEDULED_POSTS,
                &post.post_id,
                doc.version,
                &to_value(&post)?,
            ) {
                Ok(_) => {
                    info!(post_id = %post.post_id, channel_id = post.channel_id, "post due, publishing");
                    self.publish(EventPayload::PostPublished {
                        post_id: post.post_id.clone(),
                        channel_id: post.channel_id,
                        publish_at: post.publish_at.clone(),
                    })
                    .await;
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn sweep(&self) {
        match self.subscriptions.expire_due().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "subscriptions expired by sweep"),
            Err(e) => error!(error = %e, "subscription sweep failed"),
        }
        match self.tracker.expire_due() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "missions expired by sweep"),
            Err(e) => error!(error = %e, "mission sweep failed"),
        }
    }

    /// On startup, fail pending posts whose publish time is long past; a
    /// bot that was down for hours must not flood the channel on boot.
    fn mark_missed_on_startup(&self) -> Result<()> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(MISSED_GRACE_SECS)).to_rfc3339();
        let pending = self
            .docs
            .find_by_field(collections::SCHEDULED_POSTS, "$.status", "pending")?;

        let mut missed = 0;
        for doc in pending {
            let Ok(mut post) = serde_json::from_value::<ScheduledPost>(doc.body) else {
                continue;
            };
            if post.publish_at >= cutoff {
                continue;
            }
            post.status = PostStatus::Failed;
            match self.docs.compare_and_put(
                collections::SCHEDULED_POSTS,
                &post.post_id,
                doc.version,
                &to_value(&post)?,
            ) {
                Ok(_) => missed += 1,
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if missed > 0 {
            warn!(count = missed, "stale posts marked failed on startup");
        }
        Ok(())
    }

    async fn publish(&self, payload: EventPayload) {
        let event = Event::new("scheduler", None, payload);
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "scheduler event could not be published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_bus::{LocalReplayQueue, MemoryTransport};
    use fabula_ledger::CurrencyLedger;
    use fabula_store::DualStoreManager;

    fn fixture() -> (Arc<SchedulerEngine>, Arc<EventBus>) {
        let mgr = DualStoreManager::in_memory().unwrap();
        let docs = mgr.documents();
        let dir = std::env::temp_dir().join(format!("fabula-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let (bus, _dlq) = EventBus::new(
            Arc::new(MemoryTransport::new()),
            LocalReplayQueue::open(dir.join("replay.jsonl"), 100).unwrap(),
        );
        let subscriptions = Arc::new(
            SubscriptionManager::new(mgr.open_relational().unwrap(), Arc::clone(&bus)).unwrap(),
        );
        let ledger = Arc::new(CurrencyLedger::new(Arc::clone(&docs), Arc::clone(&bus)));
        let tracker = Arc::new(MissionTracker::new(
            Arc::clone(&docs),
            ledger,
            Arc::clone(&bus),
            vec![],
        ));
        (
            Arc::new(SchedulerEngine::new(docs, Arc::clone(&bus), subscriptions, tracker)),
            bus,
        )
    }

    #[tokio::test]
    async fn due_post_publishes_exactly_once() {
        let (engine, bus) = fixture();
        engine
            .schedule_post(-100200300, "Nuevo capítulo esta noche", "2020-01-01T00:00:00+00:00")
            .await
            .unwrap();
        let published_before = bus.counters.snapshot().published; // post_scheduled

        engine.tick().await.unwrap();
        let after_first = bus.counters.snapshot().published;
        assert_eq!(after_first, published_before + 1); // post_published

        // Second tick: the post is no longer pending.
        engine.tick().await.unwrap();
        assert_eq!(bus.counters.snapshot().published, after_first);

        let posts = engine.list_posts().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].status, PostStatus::Published);
        assert!(posts[0].published_at.is_some());
    }

    #[tokio::test]
    async fn future_post_stays_pending() {
        let (engine, _bus) = fixture();
        engine
            .schedule_post(-100200300, "Más tarde", "2099-01-01T00:00:00+00:00")
            .await
            .unwrap();
        engine.tick().await.unwrap();
        assert_eq!(engine.list_posts().unwrap()[0].status, PostStatus::Pending);
    }

    #[tokio::test]
    async fn long_stale_posts_fail_on_startup() {
        let (engine, _bus) = fixture();
        engine
            .schedule_post(-100200300, "De hace días", "2020-01-01T00:00:00+00:00")
            .await
            .unwrap();
        engine.mark_missed_on_startup().unwrap();
        assert_eq!(engine.list_posts().unwrap()[0].status, PostStatus::Failed);
    }
}
