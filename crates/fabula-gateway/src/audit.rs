//! Best-effort event audit trail: every event seen on the bus is copied
//! into the `events_audit` collection for the admin API and forensics.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use fabula_bus::EventHandler;
use fabula_core::events::Event;
use fabula_store::{collections, DocumentStore, StoreError};

pub struct EventAuditor {
    pub docs: Arc<DocumentStore>,
}

#[async_trait]
impl EventHandler for EventAuditor {
    fn name(&self) -> &str {
        "event_auditor"
    }

    async fn handle(&self, event: &Event) -> Result<(), String> {
        let body = serde_json::to_value(event).map_err(|e| e.to_string())?;
        match self.docs.insert(collections::EVENTS_AUDIT, &event.event_id, &body) {
            Ok(()) => Ok(()),
            // Redelivery: the audit row already exists, which is fine.
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(event_id = %event.event_id, "audit row already present");
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }
}
