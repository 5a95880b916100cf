//! Reaction gate: the single entry point for raw channel reactions.
//!
//! Only reactions in an allowed channel with an allowed emoji become
//! `reaction_observed` events; everything else is dropped silently behind a
//! counter. Input is already normalised (webhook vs polling is invisible
//! here) and user ids are internal ids, resolved by the adapter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use fabula_bus::EventBus;
use fabula_core::events::{Event, EventPayload};
use fabula_core::types::CorrelationId;

/// A reaction as normalised by the chat adapter.
#[derive(Debug, Clone)]
pub struct RawReaction {
    pub user_id: String,
    pub channel_id: i64,
    pub emoji: String,
    pub source_message_id: i64,
}

pub struct ReactionGate {
    allowed_channels: Vec<i64>,
    allowed_emojis: Vec<String>,
    bus: Arc<EventBus>,
    dropped: AtomicU64,
}

impl ReactionGate {
    pub fn new(allowed_channels: Vec<i64>, allowed_emojis: Vec<String>, bus: Arc<EventBus>) -> Self {
        Self {
            allowed_channels,
            allowed_emojis,
            bus,
            dropped: AtomicU64::new(0),
        }
    }

    /// Validate one reaction. Emits `reaction_observed` and returns true when
    /// it passes both whitelists.
    pub async fn observe(&self, reaction: RawReaction) -> bool {
        if !self.allowed_channels.contains(&reaction.channel_id)
            || !self.allowed_emojis.iter().any(|e| e == &reaction.emoji)
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                channel_id = reaction.channel_id,
                emoji = %reaction.emoji,
                "reaction outside whitelist, dropped"
            );
            return false;
        }

        let event = Event::new(
            "reaction_gate",
            Some(CorrelationId::new()),
            EventPayload::ReactionObserved {
                user_id: reaction.user_id,
                channel_id: reaction.channel_id,
                emoji: reaction.emoji,
                source_message_id: reaction.source_message_id,
            },
        );
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "reaction event could not be published");
        }
        true
    }

    /// Reactions rejected since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
