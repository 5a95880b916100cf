//! End-to-end reward chain over a real in-process bus: a validated reaction
//! completes the onboarding mission, credits the reward, and a subsequent
//! hint purchase promotes the narrative level. Also verifies per-user event
//! order as observed by an independent subscriber.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::to_value;
use tokio::sync::watch;

use fabula_bus::{EventBus, EventHandler, LocalReplayQueue, MemoryTransport};
use fabula_coordinator::steps::{LevelProgressionStep, MissionProgressStep, RewardDispatchStep};
use fabula_coordinator::WorkflowCoordinator;
use fabula_core::events::Event;
use fabula_core::health::HealthRegistry;
use fabula_ledger::CurrencyLedger;
use fabula_missions::{MissionTemplate, MissionTracker, RawReaction, ReactionGate};
use fabula_narrative::{Hint, PistaShop, Unlocks};
use fabula_store::{collections, AdminLog, DualStoreManager, WorkflowJournal};
use fabula_users::{ExternalUser, UserRegistry};

const CHANNEL: i64 = -100200300;

struct Probe {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for Probe {
    fn name(&self) -> &str {
        "probe"
    }

    async fn handle(&self, event: &Event) -> Result<(), String> {
        self.seen.lock().unwrap().push(event.event_type.clone());
        Ok(())
    }
}

struct Harness {
    registry: Arc<UserRegistry>,
    tracker: Arc<MissionTracker>,
    gate: ReactionGate,
    shop: PistaShop,
    ledger: Arc<CurrencyLedger>,
    probe: Arc<Probe>,
    _shutdown: watch::Sender<bool>,
}

async fn harness() -> Harness {
    let mgr = DualStoreManager::in_memory().unwrap();
    let docs = mgr.documents();
    let dir = std::env::temp_dir().join(format!("fabula-e2e-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let (bus, _dlq) = EventBus::new(
        Arc::new(MemoryTransport::new()),
        LocalReplayQueue::open(dir.join("replay.jsonl"), 1000).unwrap(),
    );

    let audit = AdminLog::new(Arc::clone(&docs));
    let journal = WorkflowJournal::new(Arc::clone(&docs));
    let registry = Arc::new(
        UserRegistry::new(
            mgr.open_relational().unwrap(),
            Arc::clone(&docs),
            Arc::clone(&bus),
            audit.clone(),
        )
        .unwrap(),
    );
    let ledger = Arc::new(CurrencyLedger::new(Arc::clone(&docs), Arc::clone(&bus)));
    let tracker = Arc::new(MissionTracker::new(
        Arc::clone(&docs),
        Arc::clone(&ledger),
        Arc::clone(&bus),
        vec![MissionTemplate::reaction_in_main_channel(CHANNEL, "❤")],
    ));
    let gate = ReactionGate::new(vec![CHANNEL], vec!["❤".into()], Arc::clone(&bus));
    let shop = PistaShop::new(
        Arc::clone(&docs),
        Arc::clone(&ledger),
        Arc::clone(&bus),
        journal.clone(),
        audit.clone(),
    );

    let coordinator = WorkflowCoordinator::new(
        Arc::clone(&docs),
        Arc::clone(&ledger),
        journal,
        audit,
        vec![
            Arc::new(MissionProgressStep {
                tracker: Arc::clone(&tracker),
            }),
            Arc::new(RewardDispatchStep {
                ledger: Arc::clone(&ledger),
            }),
            Arc::new(LevelProgressionStep {
                docs: Arc::clone(&docs),
                bus: Arc::clone(&bus),
            }),
        ],
    );
    coordinator.attach(&bus);

    let probe = Arc::new(Probe {
        seen: Mutex::new(Vec::new()),
    });
    bus.subscribe("*", Arc::clone(&probe) as Arc<dyn EventHandler>);

    // Shop catalogue: the level-2 pista from the seed suite.
    docs.insert(
        collections::HINTS,
        "access_level_2",
        &to_value(Hint {
            hint_id: "access_level_2".into(),
            title: "Acceso al nivel 2".into(),
            cost_currency: 10,
            unlocks: Unlocks {
                fragment_ids: vec![],
                level_promotion: Some(2),
            },
        })
        .unwrap(),
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&bus).run(Arc::new(HealthRegistry::new()), shutdown_rx.clone()));
    let coordinator = Arc::new(coordinator);
    let coord2 = Arc::clone(&coordinator);
    let rx2 = shutdown_rx.clone();
    tokio::spawn(async move { coord2.run(rx2).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    Harness {
        registry,
        tracker,
        gate,
        shop,
        ledger,
        probe,
        _shutdown: shutdown_tx,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reaction_reward_chain_then_purchase_promotion() {
    let h = harness().await;

    // Registration + onboarding mission.
    let user = h
        .registry
        .create(ExternalUser {
            external_id: 555111222,
            display_name: "viajera".into(),
            language: "es".into(),
        })
        .await
        .unwrap();
    let user_id = user.profile.internal_id.clone();
    assert_eq!(user.state.narrative_level, 1);
    assert_eq!(user.state.balance, 0);

    h.tracker
        .assign(&user_id, "reaction_in_main_channel", None)
        .await
        .unwrap();

    // A valid reaction in the configured channel drives the whole chain.
    assert!(
        h.gate
            .observe(RawReaction {
                user_id: user_id.clone(),
                channel_id: CHANNEL,
                emoji: "❤".into(),
                source_message_id: 42,
            })
            .await
    );

    let ledger = Arc::clone(&h.ledger);
    let uid = user_id.clone();
    wait_for("mission reward to land", move || {
        ledger.balance(&uid).map(|b| b == 10).unwrap_or(false)
    })
    .await;

    // The chain is observed in causal order by an independent subscriber.
    wait_for("currency event to be observed", || {
        h.probe.seen.lock().unwrap().iter().any(|t| t == "currency_credited")
    })
    .await;
    {
        let seen = h.probe.seen.lock().unwrap();
        let pos = |t: &str| seen.iter().position(|x| x == t);
        let reaction = pos("reaction_observed").expect("reaction_observed seen");
        let progress = pos("mission_progress").expect("mission_progress seen");
        let completed = pos("mission_completed").expect("mission_completed seen");
        let credited = pos("currency_credited").expect("currency_credited seen");
        assert!(reaction < progress, "reaction before progress");
        assert!(progress < completed, "progress before completion");
        assert!(completed < credited, "completion before credit");
    }

    // The redelivered completion (coordinator's reward step) never pays twice.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.ledger.balance(&user_id).unwrap(), 10);

    // Pista purchase: debit to zero, unlock, level promotion.
    let outcome = h.shop.purchase(&user_id, "access_level_2", None).await.unwrap();
    assert!(outcome.newly_unlocked);
    assert_eq!(outcome.balance_after, 0);
    assert_eq!(outcome.level_change, Some((1, 2)));

    wait_for("level change to be observed", || {
        h.probe
            .seen
            .lock()
            .unwrap()
            .iter()
            .any(|t| t == "narrative_level_changed")
    })
    .await;

    // Replay of the purchase: no new debit, no new events, balance stays 0.
    let events_before = h.probe.seen.lock().unwrap().len();
    let replay = h.shop.purchase(&user_id, "access_level_2", None).await.unwrap();
    assert!(!replay.newly_unlocked);
    assert_eq!(replay.balance_after, 0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let seen = h.probe.seen.lock().unwrap();
    let new_events: Vec<&String> = seen[events_before..]
        .iter()
        .filter(|t| {
            matches!(
                t.as_str(),
                "currency_debited" | "hint_unlocked" | "narrative_level_changed"
            )
        })
        .collect();
    assert!(new_events.is_empty(), "replay emitted {:?}", new_events);
}
