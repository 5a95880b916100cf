//! Composition root: one `Core` value owns every service and is threaded
//! through the HTTP handlers and the Telegram context. No globals; the
//! entry point builds it once and passes it down.

use std::sync::Arc;

use axum::routing::{get, put};
use axum::Router;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use fabula_bus::{BusTransport, DeadLetter, EventBus, LocalReplayQueue};
use fabula_coordinator::steps::{LevelProgressionStep, MissionProgressStep, RewardDispatchStep};
use fabula_coordinator::WorkflowCoordinator;
use fabula_core::config::FabulaConfig;
use fabula_core::health::HealthRegistry;
use fabula_ledger::CurrencyLedger;
use fabula_missions::{MissionTemplate, MissionTracker, ReactionGate};
use fabula_narrative::{NarrativeEngine, PistaShop};
use fabula_scheduler::SchedulerEngine;
use fabula_store::{AdminLog, DocumentStore, DualStoreManager, WorkflowJournal};
use fabula_telegram::adapter::PostPublisher;
use fabula_telegram::{BotContext, ChatTransport, MenuSurfaceManager};
use fabula_users::{SubscriptionManager, UserRegistry};

use crate::audit::EventAuditor;
use crate::http::ApiRateLimit;

/// Central shared state, passed as `Arc<Core>` to every handler.
pub struct Core {
    pub config: FabulaConfig,
    pub health: Arc<HealthRegistry>,
    pub stores: Arc<DualStoreManager>,
    pub docs: Arc<DocumentStore>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<UserRegistry>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub ledger: Arc<CurrencyLedger>,
    pub missions: Arc<MissionTracker>,
    pub engine: Arc<NarrativeEngine>,
    pub shop: Arc<PistaShop>,
    pub gate: Arc<ReactionGate>,
    pub scheduler: Arc<SchedulerEngine>,
    pub coordinator: Arc<WorkflowCoordinator>,
    pub surface: Arc<MenuSurfaceManager>,
    pub bot_ctx: Arc<BotContext>,
    pub api_limiter: ApiRateLimit,
}

impl Core {
    /// Wire every service together. The bus and chat transports are passed
    /// in so the same assembly runs against Redis + Telegram in production
    /// and in-memory fakes elsewhere.
    pub fn build(
        config: FabulaConfig,
        bus_transport: Arc<dyn BusTransport>,
        chat_transport: Arc<dyn ChatTransport>,
    ) -> anyhow::Result<(Arc<Core>, mpsc::Receiver<DeadLetter>)> {
        let stores = Arc::new(DualStoreManager::open(&config)?);
        let docs = stores.documents();
        let health = Arc::new(HealthRegistry::new());

        let replay = LocalReplayQueue::open(&config.bus.queue_path, config.bus.queue_capacity)?;
        let (bus, dlq_rx) = EventBus::new(bus_transport, replay);

        let audit = AdminLog::new(Arc::clone(&docs));
        let journal = WorkflowJournal::new(Arc::clone(&docs));

        let registry = Arc::new(UserRegistry::new(
            stores.open_relational()?,
            Arc::clone(&docs),
            Arc::clone(&bus),
            audit.clone(),
        )?);
        let subscriptions = Arc::new(SubscriptionManager::new(
            stores.open_relational()?,
            Arc::clone(&bus),
        )?);
        let ledger = Arc::new(CurrencyLedger::new(Arc::clone(&docs), Arc::clone(&bus)));

        let main_channel = config.gates.channel_ids_allowed.first().copied().unwrap_or(0);
        let main_emoji = config
            .gates
            .reaction_emojis_allowed
            .first()
            .cloned()
            .unwrap_or_else(|| "❤".to_string());
        let missions = Arc::new(MissionTracker::new(
            Arc::clone(&docs),
            Arc::clone(&ledger),
            Arc::clone(&bus),
            vec![MissionTemplate::reaction_in_main_channel(
                main_channel,
                &main_emoji,
            )],
        ));
        let gate = Arc::new(ReactionGate::new(
            config.gates.channel_ids_allowed.clone(),
            config.gates.reaction_emojis_allowed.clone(),
            Arc::clone(&bus),
        ));

        let engine = Arc::new(NarrativeEngine::new(
            Arc::clone(&docs),
            Arc::clone(&ledger),
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::clone(&subscriptions),
        ));
        let shop = Arc::new(PistaShop::new(
            Arc::clone(&docs),
            Arc::clone(&ledger),
            Arc::clone(&bus),
            journal.clone(),
            audit.clone(),
        ));

        let scheduler = Arc::new(SchedulerEngine::new(
            Arc::clone(&docs),
            Arc::clone(&bus),
            Arc::clone(&subscriptions),
            Arc::clone(&missions),
        ));

        let coordinator = Arc::new(WorkflowCoordinator::new(
            Arc::clone(&docs),
            Arc::clone(&ledger),
            journal,
            audit,
            vec![
                Arc::new(MissionProgressStep {
                    tracker: Arc::clone(&missions),
                }),
                Arc::new(RewardDispatchStep {
                    ledger: Arc::clone(&ledger),
                }),
                Arc::new(LevelProgressionStep {
                    docs: Arc::clone(&docs),
                    bus: Arc::clone(&bus),
                }),
            ],
        ));
        coordinator.attach(&bus);

        // Side subscribers: audit trail + scheduled-post delivery.
        bus.subscribe(
            "*",
            Arc::new(EventAuditor {
                docs: Arc::clone(&docs),
            }),
        );
        bus.subscribe(
            "post_published",
            Arc::new(PostPublisher {
                docs: Arc::clone(&docs),
                transport: Arc::clone(&chat_transport),
            }),
        );

        let surface = Arc::new(MenuSurfaceManager::new(
            Arc::clone(&chat_transport),
            Some(Arc::clone(&docs)),
        ));
        let bot_ctx = Arc::new(BotContext {
            registry: Arc::clone(&registry),
            subscriptions: Arc::clone(&subscriptions),
            ledger: Arc::clone(&ledger),
            missions: Arc::clone(&missions),
            engine: Arc::clone(&engine),
            shop: Arc::clone(&shop),
            gate: Arc::clone(&gate),
            surface: Arc::clone(&surface),
            onboarding_template: "reaction_in_main_channel".to_string(),
        });

        let core = Arc::new(Core {
            api_limiter: ApiRateLimit::new(),
            config,
            health,
            stores,
            docs,
            bus,
            registry,
            subscriptions,
            ledger,
            missions,
            engine,
            shop,
            gate,
            scheduler,
            coordinator,
            surface,
            bot_ctx,
        });
        Ok((core, dlq_rx))
    }
}

/// Assemble the admin API router.
pub fn build_router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health))
        .route("/api/v1/user/{id}/state", get(crate::http::user_state))
        .route(
            "/api/v1/user/{id}/preferences",
            put(crate::http::put_preferences),
        )
        .route(
            "/api/v1/user/{id}/subscription",
            get(crate::http::user_subscription),
        )
        .route("/api/v1/narrative/{fragment_id}", get(crate::http::fragment))
        .layer(TraceLayer::new_for_http())
        .with_state(core)
}
