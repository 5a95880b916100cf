//! Tracked-message registry: which messages the bot owns in each chat, what
//! kind they are, and when they expire.
//!
//! Per chat there is at most one main-menu message (never expires) and a set
//! of ephemerals with per-kind TTLs. Access to a chat's surface is
//! serialised through its own async lock; different chats never contend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Kinds of tracked messages. The TTLs are product policy: long enough to be
/// read, short enough to keep the chat clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    MainMenu,
    SystemNotification,
    Error,
    Success,
    Loading,
    EphemeralInfo,
    Response,
}

impl MessageKind {
    /// Time to live in seconds; `None` never expires.
    pub fn ttl_seconds(&self) -> Option<i64> {
        match self {
            MessageKind::MainMenu => None,
            MessageKind::SystemNotification => Some(5),
            MessageKind::Error => Some(10),
            MessageKind::Success => Some(3),
            MessageKind::Loading => Some(2),
            MessageKind::EphemeralInfo => Some(8),
            MessageKind::Response => Some(6),
        }
    }
}

/// One tracked ephemeral.
#[derive(Debug, Clone)]
pub struct TrackedEphemeral {
    pub message_id: i64,
    pub kind: MessageKind,
    pub expires_at: DateTime<Utc>,
}

/// Everything the bot owns in one chat.
#[derive(Debug, Default)]
pub struct ChatSurface {
    pub main_menu_id: Option<i64>,
    pub ephemerals: Vec<TrackedEphemeral>,
}

impl ChatSurface {
    /// Remove and return the ephemerals that are past their expiry.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<TrackedEphemeral> {
        let (expired, alive): (Vec<_>, Vec<_>) = self
            .ephemerals
            .drain(..)
            .partition(|e| e.expires_at <= now);
        self.ephemerals = alive;
        expired
    }

    /// Remove and return every ephemeral (menu refresh eviction).
    pub fn take_all(&mut self) -> Vec<TrackedEphemeral> {
        std::mem::take(&mut self.ephemerals)
    }

    pub fn track_ephemeral(&mut self, message_id: i64, kind: MessageKind) {
        let ttl = kind.ttl_seconds().unwrap_or(0);
        self.ephemerals.push(TrackedEphemeral {
            message_id,
            kind,
            expires_at: Utc::now() + Duration::seconds(ttl),
        });
    }
}

/// Per-chat surfaces behind per-chat locks.
#[derive(Default)]
pub struct SurfaceRegistry {
    chats: DashMap<i64, Arc<Mutex<ChatSurface>>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chat(&self, chat_id: i64) -> Arc<Mutex<ChatSurface>> {
        self.chats
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(ChatSurface::default())))
            .clone()
    }

    pub fn chat_ids(&self) -> Vec<i64> {
        self.chats.iter().map(|e| *e.key()).collect()
    }

    /// Snapshot of all tracked messages, serialisable for the
    /// `message_tracking` collection.
    pub async fn snapshot(&self, chat_id: i64) -> HashMap<String, serde_json::Value> {
        let surface = self.chat(chat_id);
        let guard = surface.lock().await;
        let mut map = HashMap::new();
        map.insert(
            "main_menu_id".to_string(),
            serde_json::to_value(guard.main_menu_id).unwrap_or_default(),
        );
        map.insert(
            "ephemeral_count".to_string(),
            serde_json::to_value(guard.ephemerals.len()).unwrap_or_default(),
        );
        map
    }
}
