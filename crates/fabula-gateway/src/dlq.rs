//! Dead-letter drain: persists every dead letter exactly once and leaves an
//! admin-log trail for operators.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use fabula_bus::DeadLetter;
use fabula_store::{collections, AdminLog, AdminLogKind, DocumentStore};
use tokio::sync::mpsc;

pub async fn run_dlq_drain(
    docs: Arc<DocumentStore>,
    audit: AdminLog,
    mut rx: mpsc::Receiver<DeadLetter>,
) {
    info!("dead-letter drain started");
    while let Some(letter) = rx.recv().await {
        warn!(
            event_id = %letter.event.event_id,
            event_type = %letter.event.event_type,
            subscriber = %letter.subscriber,
            attempts = letter.attempts,
            "event dead-lettered"
        );

        let id = format!("{}:{}", letter.subscriber, letter.event.event_id);
        let body = json!({
            "event": letter.event,
            "subscriber": letter.subscriber,
            "error": letter.error,
            "attempts": letter.attempts,
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        match docs.insert(collections::DEAD_LETTERS, &id, &body) {
            Ok(()) => {
                audit.append_best_effort(
                    AdminLogKind::DeadLetter,
                    letter.event.user_id.as_deref(),
                    json!({
                        "event_id": letter.event.event_id,
                        "event_type": letter.event.event_type,
                        "subscriber": letter.subscriber,
                        "error": letter.error,
                    }),
                );
            }
            Err(fabula_store::StoreError::AlreadyExists { .. }) => {
                // Same event dead-lettered twice for one subscriber; the
                // first record wins.
            }
            Err(e) => error!(error = %e, "dead letter could not be persisted"),
        }
    }
    info!("dead-letter drain stopped (channel closed)");
}
