//! Event envelope and the typed payload catalogue.
//!
//! Every event is a fixed envelope plus one of a closed set of payload
//! shapes, tagged by `event_type`. Payloads a build does not know about
//! decode to `None` and are routed to the dead-letter channel by consumers
//! rather than dispatched blindly.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{CorrelationId, Plan};

/// Wire envelope shared by every event.
///
/// `event_id` identifies a single publication attempt; consumers must
/// tolerate duplicates (delivery is at-least-once). `sequence` is a per-user
/// counter stamped by producers of causally ordered chains so the coordinator
/// can detect gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub payload: Value,
}

impl Event {
    /// Build an envelope around a typed payload.
    ///
    /// The `event_type` field and the tag inside `payload` are both derived
    /// from the payload variant so they can never disagree.
    pub fn new(source: &str, correlation_id: Option<CorrelationId>, payload: EventPayload) -> Self {
        let event_type = payload.kind().to_string();
        let user_id = payload.user_id().map(|u| u.to_string());
        let value = serde_json::to_value(&payload)
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now().to_rfc3339(),
            correlation_id: correlation_id.unwrap_or_default().0,
            user_id,
            source: source.to_string(),
            sequence: None,
            payload: value,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Decode the payload into its typed shape.
    ///
    /// Returns `None` for unknown event types or malformed payloads; callers
    /// decide whether that means "skip" or "dead-letter".
    pub fn decode(&self) -> Option<EventPayload> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// The closed catalogue of event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    UserRegistered {
        user_id: String,
    },
    UserDeleted {
        user_id: String,
    },
    UserInteraction {
        user_id: String,
        action: String,
        context: Value,
    },
    ReactionObserved {
        user_id: String,
        channel_id: i64,
        emoji: String,
        source_message_id: i64,
    },
    MissionAssigned {
        user_id: String,
        mission_id: String,
        template_id: String,
    },
    MissionProgress {
        user_id: String,
        mission_id: String,
        progress: MissionProgressSnapshot,
    },
    MissionCompleted {
        user_id: String,
        mission_id: String,
        reward: u64,
    },
    CurrencyCredited {
        user_id: String,
        amount: u64,
        balance_after: i64,
        reason: String,
        idempotency_key: String,
    },
    CurrencyDebited {
        user_id: String,
        amount: u64,
        balance_after: i64,
        reason: String,
        idempotency_key: String,
    },
    NarrativeFragmentDelivered {
        user_id: String,
        fragment_id: String,
    },
    NarrativeChoiceMade {
        user_id: String,
        fragment_id: String,
        choice_id: String,
    },
    HintUnlocked {
        user_id: String,
        hint_id: String,
    },
    NarrativeLevelChanged {
        user_id: String,
        old_level: u32,
        new_level: u32,
        trigger: String,
    },
    SubscriptionActivated {
        user_id: String,
        plan: Plan,
        until: Option<String>,
    },
    SubscriptionExpired {
        user_id: String,
        plan: Plan,
        until: Option<String>,
    },
    VipAccessGranted {
        user_id: String,
        resource: String,
    },
    VipAccessDenied {
        user_id: String,
        resource: String,
        reason: String,
    },
    PostScheduled {
        post_id: String,
        channel_id: i64,
        publish_at: String,
    },
    PostPublished {
        post_id: String,
        channel_id: i64,
        publish_at: String,
    },
}

/// Mission progress as carried inside `mission_progress` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionProgressSnapshot {
    pub current: u32,
    pub target: u32,
}

impl EventPayload {
    /// The `event_type` string for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::UserRegistered { .. } => "user_registered",
            EventPayload::UserDeleted { .. } => "user_deleted",
            EventPayload::UserInteraction { .. } => "user_interaction",
            EventPayload::ReactionObserved { .. } => "reaction_observed",
            EventPayload::MissionAssigned { .. } => "mission_assigned",
            EventPayload::MissionProgress { .. } => "mission_progress",
            EventPayload::MissionCompleted { .. } => "mission_completed",
            EventPayload::CurrencyCredited { .. } => "currency_credited",
            EventPayload::CurrencyDebited { .. } => "currency_debited",
            EventPayload::NarrativeFragmentDelivered { .. } => "narrative_fragment_delivered",
            EventPayload::NarrativeChoiceMade { .. } => "narrative_choice_made",
            EventPayload::HintUnlocked { .. } => "hint_unlocked",
            EventPayload::NarrativeLevelChanged { .. } => "narrative_level_changed",
            EventPayload::SubscriptionActivated { .. } => "subscription_activated",
            EventPayload::SubscriptionExpired { .. } => "subscription_expired",
            EventPayload::VipAccessGranted { .. } => "vip_access_granted",
            EventPayload::VipAccessDenied { .. } => "vip_access_denied",
            EventPayload::PostScheduled { .. } => "post_scheduled",
            EventPayload::PostPublished { .. } => "post_published",
        }
    }

    /// The user this event concerns, when it concerns one.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            EventPayload::UserRegistered { user_id }
            | EventPayload::UserDeleted { user_id }
            | EventPayload::UserInteraction { user_id, .. }
            | EventPayload::ReactionObserved { user_id, .. }
            | EventPayload::MissionAssigned { user_id, .. }
            | EventPayload::MissionProgress { user_id, .. }
            | EventPayload::MissionCompleted { user_id, .. }
            | EventPayload::CurrencyCredited { user_id, .. }
            | EventPayload::CurrencyDebited { user_id, .. }
            | EventPayload::NarrativeFragmentDelivered { user_id, .. }
            | EventPayload::NarrativeChoiceMade { user_id, .. }
            | EventPayload::HintUnlocked { user_id, .. }
            | EventPayload::NarrativeLevelChanged { user_id, .. }
            | EventPayload::SubscriptionActivated { user_id, .. }
            | EventPayload::SubscriptionExpired { user_id, .. }
            | EventPayload::VipAccessGranted { user_id, .. }
            | EventPayload::VipAccessDenied { user_id, .. } => Some(user_id),
            EventPayload::PostScheduled { .. } | EventPayload::PostPublished { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_type_and_user_from_payload() {
        let ev = Event::new(
            "ledger",
            None,
            EventPayload::CurrencyCredited {
                user_id: "u-1".into(),
                amount: 10,
                balance_after: 10,
                reason: "mission_reward".into(),
                idempotency_key: "k-1".into(),
            },
        );
        assert_eq!(ev.event_type, "currency_credited");
        assert_eq!(ev.user_id.as_deref(), Some("u-1"));
        assert!(!ev.event_id.is_empty());
        assert!(!ev.correlation_id.is_empty());
    }

    #[test]
    fn payload_round_trips_through_envelope() {
        let payload = EventPayload::NarrativeLevelChanged {
            user_id: "u-2".into(),
            old_level: 1,
            new_level: 2,
            trigger: "hint".into(),
        };
        let ev = Event::new("coordinator", None, payload.clone());
        assert_eq!(ev.decode(), Some(payload));
    }

    #[test]
    fn unknown_event_type_decodes_to_none() {
        let json = serde_json::json!({
            "event_id": "e-1",
            "event_type": "quantum_flux",
            "timestamp": "2026-01-01T00:00:00Z",
            "correlation_id": "c-1",
            "source": "elsewhere",
            "payload": {"event_type": "quantum_flux", "anything": true}
        });
        let ev: Event = serde_json::from_value(json).unwrap();
        assert!(ev.decode().is_none());
    }

    #[test]
    fn wire_json_uses_snake_case_tags() {
        let ev = Event::new(
            "gate",
            None,
            EventPayload::ReactionObserved {
                user_id: "u-3".into(),
                channel_id: -100123,
                emoji: "❤".into(),
                source_message_id: 42,
            },
        );
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""event_type":"reaction_observed""#));
        assert!(json.contains(r#""channel_id":-100123"#));
    }
}
