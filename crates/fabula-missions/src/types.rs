use serde::{Deserialize, Serialize};

use fabula_core::events::MissionProgressSnapshot;

/// What a mission asks the user to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MissionKind {
    /// React with `emoji` in `channel_id`, `target` times.
    ReactInChannel {
        channel_id: i64,
        emoji: String,
        target: u32,
    },
    /// Make `target` narrative choices.
    MakeChoices { target: u32 },
}

impl MissionKind {
    pub fn target(&self) -> u32 {
        match self {
            MissionKind::ReactInChannel { target, .. } => *target,
            MissionKind::MakeChoices { target } => *target,
        }
    }
}

/// Named mission blueprint. Templates are static configuration; missions are
/// per-user instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionTemplate {
    pub template_id: String,
    pub name: String,
    pub kind: MissionKind,
    pub reward: u64,
}

impl MissionTemplate {
    /// The onboarding mission every new user receives.
    pub fn reaction_in_main_channel(channel_id: i64, emoji: &str) -> Self {
        Self {
            template_id: "reaction_in_main_channel".to_string(),
            name: "Reacciona en el canal".to_string(),
            kind: MissionKind::ReactInChannel {
                channel_id,
                emoji: emoji.to_string(),
                target: 1,
            },
            reward: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissionStatus {
    Active,
    Completed,
    Failed,
    Expired,
}

/// Per-user mission instance, stored in the `missions` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub mission_id: String,
    pub user_id: String,
    pub template_id: String,
    pub kind: MissionKind,
    pub progress: MissionProgressSnapshot,
    pub reward: u64,
    pub status: MissionStatus,
    pub assigned_at: String,
    pub deadline: Option<String>,
}

impl Mission {
    pub fn is_complete(&self) -> bool {
        self.progress.current >= self.progress.target
    }
}
