//! Atomic user lifecycle across both stores.
//!
//! Creation writes the relational profile first, then the state document,
//! and compensates by deleting the profile when the second write fails.
//! Deletion publishes the tombstone event first, then removes the document,
//! then the profile, so concurrent readers never observe a profile without
//! state.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use fabula_bus::EventBus;
use fabula_core::events::{Event, EventPayload};
use fabula_core::types::UserId;
use fabula_store::{collections, AdminLog, AdminLogKind, DocumentStore};

use crate::db::{self, row_to_profile, PROFILE_COLUMNS};
use crate::error::{Result, UserError};
use crate::types::{ExternalUser, MergedUser, Profile, UserState, UserView};

pub struct UserRegistry {
    rel: Mutex<Connection>,
    docs: Arc<DocumentStore>,
    bus: Arc<EventBus>,
    audit: AdminLog,
}

impl UserRegistry {
    pub fn new(
        rel: Connection,
        docs: Arc<DocumentStore>,
        bus: Arc<EventBus>,
        audit: AdminLog,
    ) -> Result<Self> {
        db::init_db(&rel)?;
        Ok(Self {
            rel: Mutex::new(rel),
            docs,
            bus,
            audit,
        })
    }

    /// Create a user in both stores.
    ///
    /// Sequence: allocate internal id, insert the profile row, insert the
    /// state document. If the document insert fails, the profile row is
    /// deleted again; `StoreInconsistency` is returned only when that
    /// compensation also fails (with a reconcile_required audit entry).
    #[instrument(skip(self), fields(external_id = external.external_id))]
    pub async fn create(&self, external: ExternalUser) -> Result<MergedUser> {
        let internal_id = UserId::new();
        let now = Utc::now().to_rfc3339();

        let profile = Profile {
            internal_id: internal_id.to_string(),
            external_id: external.external_id,
            display_name: external.display_name,
            language: external.language,
            created_at: now.clone(),
            last_seen_at: now,
            active: true,
            role: Default::default(),
        };

        {
            let conn = self.rel.lock().unwrap();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO user_profiles
                 (internal_id, external_id, display_name, language,
                  created_at, last_seen_at, active, role)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                params![
                    profile.internal_id,
                    profile.external_id,
                    profile.display_name,
                    profile.language,
                    profile.created_at,
                    profile.last_seen_at,
                    profile.role.to_string(),
                ],
            )?;
            if inserted == 0 {
                return Err(UserError::AlreadyExists {
                    external_id: profile.external_id,
                });
            }
        }

        let state = UserState::new(&profile.internal_id);
        let state_doc = serde_json::to_value(&state)?;
        if let Err(doc_err) = self
            .docs
            .insert(collections::USERS, &profile.internal_id, &state_doc)
        {
            // Compensate: remove the profile row we just created.
            let compensation = {
                let conn = self.rel.lock().unwrap();
                conn.execute(
                    "DELETE FROM user_profiles WHERE internal_id = ?1",
                    params![profile.internal_id],
                )
            };
            return match compensation {
                Ok(_) => {
                    warn!(user_id = %profile.internal_id, error = %doc_err,
                          "state document insert failed, profile rolled back");
                    Err(doc_err.into())
                }
                Err(comp_err) => {
                    error!(user_id = %profile.internal_id, error = %comp_err,
                           "compensating profile delete failed");
                    self.audit.append_best_effort(
                        AdminLogKind::ReconcileRequired,
                        Some(&profile.internal_id),
                        json!({
                            "operation": "create",
                            "document_error": doc_err.to_string(),
                            "compensation_error": comp_err.to_string(),
                        }),
                    );
                    Err(UserError::StoreInconsistency {
                        user_id: profile.internal_id.clone(),
                        detail: "profile exists without state document".into(),
                    })
                }
            };
        }

        info!(user_id = %profile.internal_id, "user created");
        self.publish(EventPayload::UserRegistered {
            user_id: profile.internal_id.clone(),
        })
        .await;

        Ok(MergedUser { profile, state })
    }

    /// Look up by external id, creating on first contact.
    /// Returns the user and whether this call created them.
    pub async fn ensure(&self, external: ExternalUser) -> Result<(MergedUser, bool)> {
        if let Some(view) = self.get_by_external(external.external_id)? {
            if let Some(user) = view.complete() {
                return Ok((user, false));
            }
            // One side is missing: surface it instead of silently recreating.
            return Err(UserError::StoreInconsistency {
                user_id: external.external_id.to_string(),
                detail: "partial user awaiting reconciliation".into(),
            });
        }
        let user = self.create(external).await?;
        Ok((user, true))
    }

    /// Unified read of both stores.
    pub fn get(&self, user_id: &str) -> Result<UserView> {
        let profile = {
            let conn = self.rel.lock().unwrap();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM user_profiles WHERE internal_id = ?1",
                PROFILE_COLUMNS
            ))?;
            match stmt.query_row(params![user_id], row_to_profile) {
                Ok(p) => Some(p),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };

        let state = self.load_state(user_id)?;
        self.merge(user_id, profile, state)
    }

    pub fn get_by_external(&self, external_id: i64) -> Result<Option<UserView>> {
        let profile = {
            let conn = self.rel.lock().unwrap();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM user_profiles WHERE external_id = ?1",
                PROFILE_COLUMNS
            ))?;
            match stmt.query_row(params![external_id], row_to_profile) {
                Ok(p) => Some(p),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };

        let Some(profile) = profile else {
            return Ok(None);
        };
        let user_id = profile.internal_id.clone();
        let state = self.load_state(&user_id)?;
        Ok(Some(self.merge(&user_id, Some(profile), state)?))
    }

    /// Load only the state document (the hot path for domain services).
    pub fn load_state(&self, user_id: &str) -> Result<Option<UserState>> {
        match self.docs.get(collections::USERS, user_id)? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.body)?)),
            None => Ok(None),
        }
    }

    /// Delete a user from both stores.
    ///
    /// The tombstone event goes out first so consumers can stop touching the
    /// user, then the state document, then the profile. This order means a
    /// concurrent read never sees a profile without a state document.
    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: &str) -> Result<()> {
        if matches!(self.get(user_id)?, UserView::Partial { profile: None, state: None }) {
            return Err(UserError::NotFound {
                id: user_id.to_string(),
            });
        }

        self.publish(EventPayload::UserDeleted {
            user_id: user_id.to_string(),
        })
        .await;

        self.docs.delete(collections::USERS, user_id)?;

        let conn = self.rel.lock().unwrap();
        conn.execute(
            "DELETE FROM subscriptions WHERE user_id = ?1",
            params![user_id],
        )?;
        conn.execute(
            "DELETE FROM user_profiles WHERE internal_id = ?1",
            params![user_id],
        )?;
        info!(user_id, "user deleted");
        Ok(())
    }

    pub fn set_language(&self, user_id: &str, language: &str) -> Result<()> {
        let conn = self.rel.lock().unwrap();
        let n = conn.execute(
            "UPDATE user_profiles SET language = ?2 WHERE internal_id = ?1",
            params![user_id, language],
        )?;
        if n == 0 {
            return Err(UserError::NotFound {
                id: user_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn touch_last_seen(&self, user_id: &str) -> Result<()> {
        let conn = self.rel.lock().unwrap();
        conn.execute(
            "UPDATE user_profiles SET last_seen_at = ?2 WHERE internal_id = ?1",
            params![user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn merge(
        &self,
        user_id: &str,
        profile: Option<Profile>,
        state: Option<UserState>,
    ) -> Result<UserView> {
        match (profile, state) {
            (Some(profile), Some(state)) => Ok(UserView::Complete(MergedUser { profile, state })),
            (profile, state) => {
                if profile.is_some() || state.is_some() {
                    let missing = if profile.is_none() { "profile" } else { "state" };
                    warn!(user_id, missing, "partial user detected, reconciliation queued");
                    self.audit.append_best_effort(
                        AdminLogKind::ReconcileRequired,
                        Some(user_id),
                        json!({ "operation": "read", "missing": missing }),
                    );
                }
                Ok(UserView::Partial { profile, state })
            }
        }
    }

    async fn publish(&self, payload: EventPayload) {
        let event = Event::new("user_registry", None, payload);
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "user lifecycle event could not be published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabula_bus::{LocalReplayQueue, MemoryTransport};
    use fabula_store::DualStoreManager;

    fn fixture() -> (UserRegistry, Arc<DocumentStore>, DualStoreManager) {
        let mgr = DualStoreManager::in_memory().unwrap();
        let docs = mgr.documents();
        let dir = tempfile_dir();
        let (bus, _dlq) = EventBus::new(
            Arc::new(MemoryTransport::new()),
            LocalReplayQueue::open(dir.join("replay.jsonl"), 100).unwrap(),
        );
        let audit = AdminLog::new(Arc::clone(&docs));
        let registry =
            UserRegistry::new(mgr.open_relational().unwrap(), Arc::clone(&docs), bus, audit)
                .unwrap();
        (registry, docs, mgr)
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("fabula-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn external(id: i64) -> ExternalUser {
        ExternalUser {
            external_id: id,
            display_name: format!("user-{}", id),
            language: "es".into(),
        }
    }

    #[tokio::test]
    async fn create_writes_both_stores() {
        let (registry, docs, _mgr) = fixture();
        let user = registry.create(external(555111222)).await.unwrap();

        assert_eq!(user.state.narrative_level, 1);
        assert_eq!(user.state.balance, 0);
        assert!(docs
            .get(collections::USERS, &user.profile.internal_id)
            .unwrap()
            .is_some());

        match registry.get(&user.profile.internal_id).unwrap() {
            UserView::Complete(merged) => {
                assert_eq!(merged.profile.external_id, 555111222);
            }
            UserView::Partial { .. } => panic!("expected complete user"),
        }
    }

    #[tokio::test]
    async fn duplicate_external_id_is_rejected() {
        let (registry, _docs, _mgr) = fixture();
        registry.create(external(1)).await.unwrap();
        let err = registry.create(external(1)).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn partial_user_is_reported_and_queued_for_reconciliation() {
        let (registry, docs, _mgr) = fixture();
        let user = registry.create(external(7)).await.unwrap();

        // Lose the document side, as a crashed deletion would.
        docs.delete(collections::USERS, &user.profile.internal_id)
            .unwrap();
        match registry.get(&user.profile.internal_id).unwrap() {
            UserView::Partial { profile, state } => {
                assert!(profile.is_some());
                assert!(state.is_none());
            }
            UserView::Complete(_) => panic!("expected partial user"),
        }
        // The partial read must have queued a reconcile entry.
        let entries = docs
            .find_by_field(collections::ADMIN_LOGS, "$.kind", "reconcile_required")
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let (registry, _docs, _mgr) = fixture();
        let (first, created) = registry.ensure(external(42)).await.unwrap();
        assert!(created);
        let (second, created_again) = registry.ensure(external(42)).await.unwrap();
        assert!(!created_again);
        assert_eq!(first.profile.internal_id, second.profile.internal_id);
    }

    #[tokio::test]
    async fn delete_removes_both_sides() {
        let (registry, docs, _mgr) = fixture();
        let user = registry.create(external(9)).await.unwrap();
        registry.delete(&user.profile.internal_id).await.unwrap();

        assert!(docs
            .get(collections::USERS, &user.profile.internal_id)
            .unwrap()
            .is_none());
        match registry.get(&user.profile.internal_id).unwrap() {
            UserView::Partial { profile, state } => {
                assert!(profile.is_none());
                assert!(state.is_none());
            }
            UserView::Complete(_) => panic!("user should be gone"),
        }
    }
}
