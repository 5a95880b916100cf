use serde::{Deserialize, Serialize};

/// Read-mostly narrative content, `narrative_fragments` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub fragment_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub vip_required: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Fragment {
    pub fn choice(&self, choice_id: &str) -> Option<&Choice> {
        self.choices.iter().find(|c| c.choice_id == choice_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub choice_id: String,
    pub label: String,
    /// None marks a terminal choice: the story pauses here.
    pub next_fragment_id: Option<String>,
    #[serde(default)]
    pub preconditions: Preconditions,
    #[serde(default)]
    pub rewards: Rewards,
}

/// Gates a choice may impose beyond the fragment's own VIP flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preconditions {
    pub min_level: Option<u32>,
    #[serde(default)]
    pub required_hints: Vec<String>,
    #[serde(default)]
    pub required_items: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rewards {
    pub currency: Option<u64>,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub hints: Vec<String>,
}

impl Rewards {
    pub fn is_empty(&self) -> bool {
        self.currency.is_none() && self.items.is_empty() && self.hints.is_empty()
    }
}

/// Purchasable hint ("pista"), `hints` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hint {
    pub hint_id: String,
    pub title: String,
    pub cost_currency: u64,
    #[serde(default)]
    pub unlocks: Unlocks,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Unlocks {
    #[serde(default)]
    pub fragment_ids: Vec<String>,
    /// Promote the user to this narrative level when it exceeds their
    /// current one.
    pub level_promotion: Option<u32>,
}
