use serde::{Deserialize, Serialize};
use serde_json::Value;

use fabula_core::types::{Plan, SubscriptionStatus, UserRole};

/// Inbound identity from the chat transport, used to create users.
#[derive(Debug, Clone)]
pub struct ExternalUser {
    pub external_id: i64,
    pub display_name: String,
    pub language: String,
}

/// Profile record, relational store. Mostly immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub internal_id: String,
    pub external_id: i64,
    pub display_name: String,
    pub language: String,
    pub created_at: String,
    pub last_seen_at: String,
    pub active: bool,
    pub role: UserRole,
}

/// Mutable user state document, document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: String,
    pub balance: i64,
    pub narrative_level: u32,
    pub worthiness: f64,
    pub current_fragment_id: Option<String>,
    #[serde(default)]
    pub completed_fragments: Vec<String>,
    #[serde(default)]
    pub choices_log: Vec<ChoiceRecord>,
    #[serde(default)]
    pub unlocked_hints: Vec<String>,
    #[serde(default)]
    pub items: Vec<String>,
    pub menu_context: Option<String>,
    #[serde(default)]
    pub scratchpad: Value,
}

impl UserState {
    /// Fresh state for a new user: level 1, zero balance, empty progress.
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: 0,
            narrative_level: 1,
            worthiness: 0.0,
            current_fragment_id: None,
            completed_fragments: Vec::new(),
            choices_log: Vec::new(),
            unlocked_hints: Vec::new(),
            items: Vec::new(),
            menu_context: None,
            scratchpad: Value::Null,
        }
    }

    pub fn has_hint(&self, hint_id: &str) -> bool {
        self.unlocked_hints.iter().any(|h| h == hint_id)
    }

    pub fn has_item(&self, item_id: &str) -> bool {
        self.items.iter().any(|i| i == item_id)
    }
}

/// One entry of the choices log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceRecord {
    pub fragment_id: String,
    pub choice_id: String,
    pub chosen_at: String,
}

/// Profile and state merged into one value.
#[derive(Debug, Clone, Serialize)]
pub struct MergedUser {
    pub profile: Profile,
    pub state: UserState,
}

/// Unified read result. A user present on only one side is reported as
/// `Partial`, never as "not found": the missing side is a reconciliation
/// problem, not an identity problem.
#[derive(Debug, Clone)]
pub enum UserView {
    Complete(MergedUser),
    Partial {
        profile: Option<Profile>,
        state: Option<UserState>,
    },
}

impl UserView {
    pub fn complete(self) -> Option<MergedUser> {
        match self {
            UserView::Complete(user) => Some(user),
            UserView::Partial { .. } => None,
        }
    }
}

/// Subscription row, relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub start_at: String,
    pub end_at: Option<String>,
}
