//! Chat-cleanliness state machine.
//!
//! Each chat holds exactly one live main-menu message which is edited in
//! place; everything else is an ephemeral with a TTL. Menu refreshes evict
//! all ephemerals immediately, a 2 s tick deletes the expired ones, and all
//! mutations respect the per-chat rate limiter.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fabula_store::{collections, DocumentStore};

use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::tracker::{MessageKind, SurfaceRegistry};
use crate::transport::{ChatTransport, DeleteOutcome, EditOutcome, Keyboard};

/// Cleanup pass cadence.
const CLEANUP_INTERVAL_SECS: u64 = 2;
/// Delete retries after the first failure.
const DELETE_RETRIES: u32 = 2;
/// Pause between delete retries.
const DELETE_RETRY_MS: u64 = 500;

pub struct MenuSurfaceManager {
    transport: Arc<dyn ChatTransport>,
    registry: SurfaceRegistry,
    limiter: RateLimiter,
    /// Main-menu ids are mirrored here so a restarted process can keep
    /// editing the same message instead of sending a duplicate menu.
    docs: Option<Arc<DocumentStore>>,
}

impl MenuSurfaceManager {
    pub fn new(transport: Arc<dyn ChatTransport>, docs: Option<Arc<DocumentStore>>) -> Self {
        Self {
            transport,
            registry: SurfaceRegistry::new(),
            limiter: RateLimiter::new(),
            docs,
        }
    }

    /// Render the main menu for a chat.
    ///
    /// Edits the existing menu message in place when possible; otherwise
    /// sends a new one and deletes the old. Every refresh evicts all
    /// tracked ephemerals so the menu is the only thing left on screen.
    pub async fn render_menu(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i64> {
        let surface = self.registry.chat(chat_id);
        let mut guard = surface.lock().await;

        let evicted = guard.take_all();
        for ephemeral in evicted {
            self.delete_quietly(chat_id, ephemeral.message_id).await;
        }

        if guard.main_menu_id.is_none() {
            guard.main_menu_id = self.restore_main_menu_id(chat_id);
        }

        if let Some(menu_id) = guard.main_menu_id {
            self.limiter.acquire(chat_id).await;
            match self.transport.edit_text(chat_id, menu_id, text, keyboard).await {
                Ok(EditOutcome::Edited) => {
                    debug!(chat_id, menu_id, "main menu edited in place");
                    return Ok(menu_id);
                }
                Ok(EditOutcome::NotFound) => {
                    debug!(chat_id, menu_id, "main menu gone, sending a fresh one");
                }
                Err(e) => {
                    warn!(chat_id, error = %e, "menu edit failed, sending a fresh one");
                }
            }
        }

        // Send-new path: the previous menu (if any) is deleted so the chat
        // never shows two menus.
        let new_id = self.transport.send_text(chat_id, text, keyboard).await?;
        let old = guard.main_menu_id.replace(new_id);
        if let Some(old_id) = old {
            if old_id != new_id {
                self.delete_quietly(chat_id, old_id).await;
            }
        }
        self.persist_main_menu_id(chat_id, new_id);
        info!(chat_id, menu_id = new_id, "main menu message created");
        Ok(new_id)
    }

    /// Send a TTL-tracked ephemeral message.
    pub async fn send_ephemeral(
        &self,
        chat_id: i64,
        kind: MessageKind,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i64> {
        debug_assert!(kind != MessageKind::MainMenu, "menus go through render_menu");
        let message_id = self.transport.send_text(chat_id, text, keyboard).await?;
        let surface = self.registry.chat(chat_id);
        surface.lock().await.track_ephemeral(message_id, kind);
        Ok(message_id)
    }

    /// Hook invoked when a user command arrives: sweep this chat's due
    /// ephemerals before the handler answers.
    pub async fn on_user_command(&self, chat_id: i64) {
        self.cleanup_chat(chat_id).await;
    }

    /// Delete this chat's expired ephemerals.
    pub async fn cleanup_chat(&self, chat_id: i64) {
        let surface = self.registry.chat(chat_id);
        let expired = {
            let mut guard = surface.lock().await;
            guard.take_expired(Utc::now())
        };
        for ephemeral in expired {
            debug!(chat_id, message_id = ephemeral.message_id, "ephemeral expired");
            self.delete_quietly(chat_id, ephemeral.message_id).await;
        }
    }

    /// Periodic cleanup over every known chat. Runs until shutdown.
    pub async fn run_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("surface cleanup loop started");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for chat_id in self.registry.chat_ids() {
                        self.cleanup_chat(chat_id).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("surface cleanup loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn registry(&self) -> &SurfaceRegistry {
        &self.registry
    }

    /// Delete with bounded retries; a message that will not die is forgotten
    /// rather than looped on (a stale message beats a hot loop).
    async fn delete_quietly(&self, chat_id: i64, message_id: i64) {
        self.limiter.acquire(chat_id).await;
        for attempt in 0..=DELETE_RETRIES {
            match self.transport.delete_message(chat_id, message_id).await {
                Ok(DeleteOutcome::Deleted) | Ok(DeleteOutcome::NotFound) => return,
                Err(e) => {
                    if attempt < DELETE_RETRIES {
                        tokio::time::sleep(std::time::Duration::from_millis(DELETE_RETRY_MS))
                            .await;
                    } else {
                        warn!(chat_id, message_id, error = %e, "delete failed, forgetting message");
                    }
                }
            }
        }
    }

    fn persist_main_menu_id(&self, chat_id: i64, message_id: i64) {
        let Some(docs) = &self.docs else { return };
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "kind": "main_menu",
            "is_main_menu": true,
            "updated_at": Utc::now().to_rfc3339(),
        });
        if let Err(e) = docs.put(collections::MESSAGE_TRACKING, &chat_id.to_string(), &body) {
            warn!(chat_id, error = %e, "main menu id could not be persisted");
        }
    }

    fn restore_main_menu_id(&self, chat_id: i64) -> Option<i64> {
        let docs = self.docs.as_ref()?;
        let doc = docs
            .get(collections::MESSAGE_TRACKING, &chat_id.to_string())
            .ok()??;
        doc.body["message_id"].as_i64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{Call, MockTransport};
    use std::sync::atomic::Ordering;

    const CHAT: i64 = 7001;

    fn manager() -> (Arc<MenuSurfaceManager>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let surface = Arc::new(MenuSurfaceManager::new(
            transport.clone() as Arc<dyn ChatTransport>,
            None,
        ));
        (surface, transport)
    }

    #[tokio::test]
    async fn repeated_render_keeps_single_menu() {
        let (surface, transport) = manager();
        let first = surface.render_menu(CHAT, "menu v1", None).await.unwrap();
        let second = surface.render_menu(CHAT, "menu v2", None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.live_messages(CHAT), vec![first]);
    }

    #[tokio::test]
    async fn lost_menu_message_falls_back_to_send_and_delete() {
        let (surface, transport) = manager();
        let first = surface.render_menu(CHAT, "menu v1", None).await.unwrap();

        transport.fail_edits.store(true, Ordering::SeqCst);
        let second = surface.render_menu(CHAT, "menu v2", None).await.unwrap();

        assert_ne!(first, second);
        // Only the new menu is left alive.
        assert_eq!(transport.live_messages(CHAT), vec![second]);
    }

    #[tokio::test]
    async fn menu_refresh_evicts_all_ephemerals() {
        let (surface, transport) = manager();
        surface.render_menu(CHAT, "menu", None).await.unwrap();
        surface
            .send_ephemeral(CHAT, MessageKind::Error, "fallo", None)
            .await
            .unwrap();
        surface
            .send_ephemeral(CHAT, MessageKind::Response, "datos", None)
            .await
            .unwrap();
        assert_eq!(transport.live_messages(CHAT).len(), 3);

        let menu_id = surface.render_menu(CHAT, "menu v2", None).await.unwrap();
        assert_eq!(transport.live_messages(CHAT), vec![menu_id]);
    }

    #[tokio::test]
    async fn expired_ephemerals_are_deleted_on_cleanup() {
        let (surface, transport) = manager();
        let msg = surface
            .send_ephemeral(CHAT, MessageKind::Loading, "cargando", None)
            .await
            .unwrap();

        // Not yet expired: survives the pass.
        surface.cleanup_chat(CHAT).await;
        assert_eq!(transport.live_messages(CHAT), vec![msg]);

        // Force expiry and sweep again.
        {
            let chat = surface.registry().chat(CHAT);
            let mut guard = chat.lock().await;
            for e in guard.ephemerals.iter_mut() {
                e.expires_at = Utc::now() - chrono::Duration::seconds(1);
            }
        }
        surface.cleanup_chat(CHAT).await;
        assert!(transport.live_messages(CHAT).is_empty());
    }

    #[tokio::test]
    async fn undeletable_message_is_retried_then_forgotten() {
        let (surface, transport) = manager();
        surface
            .send_ephemeral(CHAT, MessageKind::Success, "ok", None)
            .await
            .unwrap();
        {
            let chat = surface.registry().chat(CHAT);
            let mut guard = chat.lock().await;
            for e in guard.ephemerals.iter_mut() {
                e.expires_at = Utc::now() - chrono::Duration::seconds(1);
            }
        }

        transport.fail_deletes.store(true, Ordering::SeqCst);
        surface.cleanup_chat(CHAT).await;

        let deletes = transport
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Delete { .. }))
            .count();
        assert_eq!(deletes, 3); // first try + two retries

        // Forgotten: the next pass does not retry it again.
        let before = transport.calls().len();
        surface.cleanup_chat(CHAT).await;
        assert_eq!(transport.calls().len(), before);
    }

    #[tokio::test]
    async fn main_menu_id_restored_from_store() {
        let docs = Arc::new(fabula_store::DocumentStore::open_in_memory().unwrap());
        let transport = Arc::new(MockTransport::new());
        let surface = MenuSurfaceManager::new(
            transport.clone() as Arc<dyn ChatTransport>,
            Some(Arc::clone(&docs)),
        );
        let id = surface.render_menu(CHAT, "menu", None).await.unwrap();

        // A fresh manager (fresh process) edits the same message.
        let surface2 = MenuSurfaceManager::new(
            transport.clone() as Arc<dyn ChatTransport>,
            Some(docs),
        );
        let id2 = surface2.render_menu(CHAT, "menu again", None).await.unwrap();
        assert_eq!(id, id2);
        assert_eq!(transport.live_messages(CHAT), vec![id]);
    }
}
