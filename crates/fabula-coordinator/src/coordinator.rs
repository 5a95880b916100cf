//! The workflow coordinator.
//!
//! One wildcard bus subscription feeds `CoordinatorSubscriber`; decodable
//! events are routed into per-user mailboxes (strict FIFO per user,
//! concurrency across users), undecodable ones bounce back to the bus for
//! dead-lettering. Inside a user's lane, events with a producer-stamped
//! sequence are re-ordered within a bounded window; the dispatch table then
//! applies the registered steps.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use fabula_bus::{EventBus, EventHandler};
use fabula_core::events::Event;
use fabula_ledger::{keys, CurrencyLedger};
use fabula_store::{collections, AdminLog, AdminLogKind, DocumentStore, WorkflowJournal};

use crate::mailbox::Mailboxes;
use crate::steps::CoordinatorStep;

/// How long an out-of-order event may wait for its predecessor.
const ORDER_WINDOW: Duration = Duration::from_secs(30);
/// Per-user mailbox capacity.
const MAILBOX_CAPACITY: usize = 256;
/// Attempts per step before the event is recorded as undeliverable.
const STEP_ATTEMPTS: u32 = 3;

enum CoordMsg {
    Deliver(Event),
    FlushDue,
}

#[derive(Default)]
struct OrderState {
    next_seq: Option<u64>,
    parked: BTreeMap<u64, (Event, Instant)>,
}

struct Inner {
    table: HashMap<&'static str, Vec<Arc<dyn CoordinatorStep>>>,
    mailboxes: Mailboxes<CoordMsg>,
    order: DashMap<String, OrderState>,
    audit: AdminLog,
    journal: WorkflowJournal,
    ledger: Arc<CurrencyLedger>,
    docs: Arc<DocumentStore>,
}

pub struct WorkflowCoordinator {
    inner: Arc<Inner>,
}

impl WorkflowCoordinator {
    pub fn new(
        docs: Arc<DocumentStore>,
        ledger: Arc<CurrencyLedger>,
        journal: WorkflowJournal,
        audit: AdminLog,
        steps: Vec<Arc<dyn CoordinatorStep>>,
    ) -> Self {
        // Dispatch table: event type -> ordered step list, fixed at startup.
        let mut table: HashMap<&'static str, Vec<Arc<dyn CoordinatorStep>>> = HashMap::new();
        for step in steps {
            for event_type in step.event_types().iter().copied() {
                table.entry(event_type).or_default().push(Arc::clone(&step));
            }
            info!(step = step.name(), "coordinator step registered");
        }

        Self {
            inner: Arc::new(Inner {
                table,
                mailboxes: Mailboxes::new(MAILBOX_CAPACITY),
                order: DashMap::new(),
                audit,
                journal,
                ledger,
                docs,
            }),
        }
    }

    /// Register the coordinator on the bus. One wildcard subscription keeps
    /// mailbox creation single-threaded and routes unknown schemas to the
    /// dead-letter queue via the bus retry path.
    pub fn attach(&self, bus: &EventBus) {
        bus.subscribe(
            "*",
            Arc::new(CoordinatorSubscriber {
                inner: Arc::clone(&self.inner),
            }),
        );
    }

    /// Periodic duties: flush order-window timeouts. Runs until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("workflow coordinator started");
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let due = self.inner.users_with_due_parked();
                    for user in due {
                        let inner = Arc::clone(&self.inner);
                        self.inner
                            .mailboxes
                            .dispatch(&user, CoordMsg::FlushDue, move |key, rx| {
                                spawn_worker(inner, key, rx);
                            })
                            .await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("workflow coordinator shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Finish (by compensation) workflows that were in flight when the
    /// previous process died. Called once at startup.
    pub async fn replay_incomplete(&self) -> crate::error::Result<usize> {
        let mut handled = 0;
        for entry in self.inner.journal.incomplete()? {
            if entry.kind != "pista_purchase" {
                warn!(workflow_id = %entry.workflow_id, kind = %entry.kind,
                      "unknown journaled workflow kind, marking failed");
                self.inner.journal.fail(&entry.workflow_id, "unknown workflow kind")?;
                continue;
            }

            let debit_key = entry.checkpoint["debit_key"].as_str().unwrap_or_default().to_string();
            let cost = entry.checkpoint["cost"].as_u64().unwrap_or(0);

            // Only compensate when the debit provably committed; an
            // interrupted workflow before the debit has nothing to undo.
            let debited = !debit_key.is_empty()
                && self
                    .inner
                    .docs
                    .get(collections::CURRENCY_TRANSACTIONS, &debit_key)?
                    .is_some();

            if debited && cost > 0 {
                match self
                    .inner
                    .ledger
                    .credit(
                        &entry.user_id,
                        cost,
                        "pista_purchase_refund",
                        &keys::compensation(&debit_key),
                        None,
                    )
                    .await
                {
                    Ok(receipt) => {
                        info!(
                            workflow_id = %entry.workflow_id,
                            user_id = %entry.user_id,
                            replayed = receipt.replayed,
                            "interrupted purchase compensated on startup"
                        );
                        self.inner.audit.append_best_effort(
                            AdminLogKind::CompensationApplied,
                            Some(&entry.user_id),
                            json!({ "workflow_id": entry.workflow_id, "recovered": true }),
                        );
                    }
                    Err(e) => {
                        error!(workflow_id = %entry.workflow_id, error = %e,
                               "startup compensation failed");
                        self.inner.audit.append_best_effort(
                            AdminLogKind::CompensationFailed,
                            Some(&entry.user_id),
                            json!({ "workflow_id": entry.workflow_id, "error": e.to_string() }),
                        );
                    }
                }
            }
            self.inner.journal.fail(&entry.workflow_id, "interrupted, recovered on startup")?;
            handled += 1;
        }
        if handled > 0 {
            info!(count = handled, "incomplete workflows recovered");
        }
        Ok(handled)
    }
}

/// Bus-facing adapter. Kept separate so the bus owns only the narrow
/// `EventHandler` view of the coordinator.
struct CoordinatorSubscriber {
    inner: Arc<Inner>,
}

#[async_trait]
impl EventHandler for CoordinatorSubscriber {
    fn name(&self) -> &str {
        "workflow_coordinator"
    }

    async fn handle(&self, event: &Event) -> Result<(), String> {
        let Some(payload) = event.decode() else {
            // Unknown schema: refuse, so the bus retries and dead-letters.
            return Err(format!("unknown event schema: {}", event.event_type));
        };

        if !self.inner.table.contains_key(event.event_type.as_str()) {
            return Ok(());
        }

        let key = payload
            .user_id()
            .map(|u| u.to_string())
            .or_else(|| event.user_id.clone())
            .unwrap_or_else(|| event.correlation_id.clone());

        let inner = Arc::clone(&self.inner);
        self.inner
            .mailboxes
            .dispatch(&key, CoordMsg::Deliver(event.clone()), move |key, rx| {
                spawn_worker(inner, key, rx);
            })
            .await;
        Ok(())
    }
}

fn spawn_worker(inner: Arc<Inner>, key: String, mut rx: mpsc::Receiver<CoordMsg>) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                CoordMsg::Deliver(event) => inner.deliver(&key, event).await,
                CoordMsg::FlushDue => inner.flush_due(&key).await,
            }
        }
    });
}

impl Inner {
    async fn deliver(&self, key: &str, event: Event) {
        let Some(seq) = event.sequence else {
            self.apply_steps(&event).await;
            return;
        };

        // Decide under the map entry lock, act outside it.
        enum Decision {
            Process,
            Parked,
        }
        let decision = {
            let mut entry = self.order.entry(key.to_string()).or_default();
            match entry.next_seq {
                Some(expected) if seq > expected => {
                    entry.parked.insert(seq, (event.clone(), Instant::now() + ORDER_WINDOW));
                    Decision::Parked
                }
                Some(expected) => {
                    // In order, or a redelivery of something already seen;
                    // both are processed (consumers are idempotent).
                    if seq == expected {
                        entry.next_seq = Some(seq + 1);
                    }
                    Decision::Process
                }
                None => {
                    entry.next_seq = Some(seq + 1);
                    Decision::Process
                }
            }
        };

        match decision {
            Decision::Parked => {
                warn!(user = key, seq, "event ahead of sequence, parked");
            }
            Decision::Process => {
                self.apply_steps(&event).await;
                // Parked successors may now be contiguous.
                loop {
                    let next = {
                        let mut entry = self.order.entry(key.to_string()).or_default();
                        let expected = entry.next_seq.unwrap_or(0);
                        match entry.parked.remove(&expected) {
                            Some((ev, _)) => {
                                entry.next_seq = Some(expected + 1);
                                Some(ev)
                            }
                            None => None,
                        }
                    };
                    match next {
                        Some(ev) => self.apply_steps(&ev).await,
                        None => break,
                    }
                }
            }
        }
    }

    /// Process parked events whose wait window expired, in sequence order.
    async fn flush_due(&self, key: &str) {
        loop {
            let expired = {
                let mut entry = self.order.entry(key.to_string()).or_default();
                let now = Instant::now();
                let due_seq = entry
                    .parked
                    .iter()
                    .find(|(_, (_, deadline))| *deadline <= now)
                    .map(|(seq, _)| *seq);
                match due_seq {
                    Some(seq) => {
                        let (event, _) = entry.parked.remove(&seq).expect("key just seen");
                        let next = entry.next_seq.unwrap_or(0).max(seq + 1);
                        entry.next_seq = Some(next);
                        Some((seq, event))
                    }
                    None => None,
                }
            };

            let Some((seq, event)) = expired else { return };
            warn!(user = key, seq, "order window elapsed, processing out of order");
            self.audit.append_best_effort(
                AdminLogKind::OrderTimeout,
                Some(key),
                json!({
                    "event_id": event.event_id,
                    "event_type": event.event_type,
                    "sequence": seq,
                }),
            );
            self.apply_steps(&event).await;
        }
    }

    fn users_with_due_parked(&self) -> Vec<String> {
        let now = Instant::now();
        self.order
            .iter()
            .filter(|entry| entry.parked.values().any(|(_, deadline)| *deadline <= now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn apply_steps(&self, event: &Event) {
        let Some(payload) = event.decode() else {
            return;
        };
        let Some(steps) = self.table.get(event.event_type.as_str()) else {
            return;
        };

        for step in steps {
            let mut last_error = String::new();
            let mut done = false;
            for attempt in 1..=STEP_ATTEMPTS {
                match step.apply(event, &payload).await {
                    Ok(()) => {
                        done = true;
                        break;
                    }
                    Err(e) => {
                        last_error = e;
                        if attempt < STEP_ATTEMPTS {
                            tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                        }
                    }
                }
            }
            if !done {
                error!(
                    step = step.name(),
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %last_error,
                    "coordinator step failed after retries"
                );
                self.audit.append_best_effort(
                    AdminLogKind::DeadLetter,
                    event.user_id.as_deref(),
                    json!({
                        "step": step.name(),
                        "event_id": event.event_id,
                        "event_type": event.event_type,
                        "error": last_error,
                    }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_core::events::EventPayload;
    use std::sync::Mutex;

    struct RecordingStep {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CoordinatorStep for RecordingStep {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn event_types(&self) -> &'static [&'static str] {
            &["user_interaction"]
        }

        async fn apply(&self, _event: &Event, payload: &EventPayload) -> Result<(), String> {
            if let EventPayload::UserInteraction { action, .. } = payload {
                self.seen.lock().unwrap().push(action.clone());
            }
            Ok(())
        }
    }

    fn interaction(user: &str, action: &str, seq: Option<u64>) -> Event {
        let ev = Event::new(
            "test",
            None,
            EventPayload::UserInteraction {
                user_id: user.into(),
                action: action.into(),
                context: serde_json::Value::Null,
            },
        );
        match seq {
            Some(s) => ev.with_sequence(s),
            None => ev,
        }
    }

    fn fixture(step: Arc<RecordingStep>) -> WorkflowCoordinator {
        let docs = Arc::new(DocumentStore::open_in_memory().unwrap());
        let dir = std::env::temp_dir().join(format!("fabula-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let (bus, _dlq) = fabula_bus::EventBus::new(
            Arc::new(fabula_bus::MemoryTransport::new()),
            fabula_bus::LocalReplayQueue::open(dir.join("replay.jsonl"), 100).unwrap(),
        );
        let ledger = Arc::new(CurrencyLedger::new(Arc::clone(&docs), bus));
        let journal = WorkflowJournal::new(Arc::clone(&docs));
        let audit = AdminLog::new(Arc::clone(&docs));
        WorkflowCoordinator::new(docs, ledger, journal, audit, vec![step])
    }

    #[tokio::test]
    async fn sequenced_events_are_reordered() {
        let step = Arc::new(RecordingStep {
            seen: Mutex::new(Vec::new()),
        });
        let coordinator = fixture(Arc::clone(&step));

        // Arrivals: 0, 2, 1. Expected processing: 0, 1, 2.
        coordinator.inner.deliver("u-1", interaction("u-1", "first", Some(0))).await;
        coordinator.inner.deliver("u-1", interaction("u-1", "third", Some(2))).await;
        coordinator.inner.deliver("u-1", interaction("u-1", "second", Some(1))).await;

        assert_eq!(
            *step.seen.lock().unwrap(),
            vec!["first".to_string(), "second".to_string(), "third".to_string()]
        );
    }

    #[tokio::test]
    async fn unsequenced_events_process_immediately() {
        let step = Arc::new(RecordingStep {
            seen: Mutex::new(Vec::new()),
        });
        let coordinator = fixture(Arc::clone(&step));

        coordinator.inner.deliver("u-1", interaction("u-1", "a", None)).await;
        coordinator.inner.deliver("u-1", interaction("u-1", "b", None)).await;
        assert_eq!(*step.seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn orphaned_event_processes_after_window_with_audit() {
        let step = Arc::new(RecordingStep {
            seen: Mutex::new(Vec::new()),
        });
        let coordinator = fixture(Arc::clone(&step));

        coordinator.inner.deliver("u-1", interaction("u-1", "first", Some(0))).await;
        // Sequence 2 arrives; 1 never does.
        coordinator.inner.deliver("u-1", interaction("u-1", "orphan", Some(2))).await;
        assert_eq!(step.seen.lock().unwrap().len(), 1);

        // Force the deadline into the past instead of waiting 30 s.
        {
            let mut entry = coordinator.inner.order.get_mut("u-1").unwrap();
            for (_, deadline) in entry.parked.values_mut() {
                *deadline = Instant::now() - Duration::from_secs(1);
            }
        }
        coordinator.inner.flush_due("u-1").await;

        assert_eq!(
            *step.seen.lock().unwrap(),
            vec!["first".to_string(), "orphan".to_string()]
        );
        let audits = coordinator
            .inner
            .docs
            .find_by_field(collections::ADMIN_LOGS, "$.kind", "order_timeout")
            .unwrap();
        assert_eq!(audits.len(), 1);
    }
}
