//! Dependency bundle threaded through every handler.
//!
//! Built once at startup by the composition root; handlers receive it as
//! `Arc<BotContext>` through the dispatcher's dependency injection.

use std::sync::Arc;

use fabula_ledger::CurrencyLedger;
use fabula_missions::{MissionTracker, ReactionGate};
use fabula_narrative::{NarrativeEngine, PistaShop};
use fabula_users::{SubscriptionManager, UserRegistry};

use crate::surface::MenuSurfaceManager;

pub struct BotContext {
    pub registry: Arc<UserRegistry>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub ledger: Arc<CurrencyLedger>,
    pub missions: Arc<MissionTracker>,
    pub engine: Arc<NarrativeEngine>,
    pub shop: Arc<PistaShop>,
    pub gate: Arc<ReactionGate>,
    pub surface: Arc<MenuSurfaceManager>,
    /// Template assigned to every fresh user on /start.
    pub onboarding_template: String,
}
