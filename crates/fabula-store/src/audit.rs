//! Append-only admin log, stored as documents in the `admin_logs` collection.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::document::{collections, DocumentStore};
use crate::error::Result;

/// Why an admin log entry was written. The set is closed so operators can
/// filter reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminLogKind {
    ReconcileRequired,
    OrderTimeout,
    CompensationApplied,
    CompensationFailed,
    PartialFailure,
    DeadLetter,
}

impl AdminLogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminLogKind::ReconcileRequired => "reconcile_required",
            AdminLogKind::OrderTimeout => "order_timeout",
            AdminLogKind::CompensationApplied => "compensation_applied",
            AdminLogKind::CompensationFailed => "compensation_failed",
            AdminLogKind::PartialFailure => "partial_failure",
            AdminLogKind::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for AdminLogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle for writing audit entries. Cheap to clone and share.
#[derive(Clone)]
pub struct AdminLog {
    docs: Arc<DocumentStore>,
}

impl AdminLog {
    pub fn new(docs: Arc<DocumentStore>) -> Self {
        Self { docs }
    }

    /// Append one entry. Returns the entry id.
    pub fn append(&self, kind: AdminLogKind, user_id: Option<&str>, detail: Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let body = json!({
            "kind": kind.as_str(),
            "user_id": user_id,
            "detail": detail,
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        self.docs.insert(collections::ADMIN_LOGS, &id, &body)?;
        Ok(id)
    }

    /// Best-effort variant for paths that must not fail because auditing
    /// failed. Logs and swallows the error.
    pub fn append_best_effort(&self, kind: AdminLogKind, user_id: Option<&str>, detail: Value) {
        if let Err(e) = self.append(kind, user_id, detail) {
            warn!(kind = %kind, error = %e, "admin log append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_are_retained() {
        let docs = Arc::new(DocumentStore::open_in_memory().unwrap());
        let log = AdminLog::new(Arc::clone(&docs));

        log.append(AdminLogKind::ReconcileRequired, Some("u-1"), json!({"side": "document"}))
            .unwrap();
        log.append(AdminLogKind::OrderTimeout, Some("u-1"), json!({"waited_ms": 30000}))
            .unwrap();

        assert_eq!(docs.count(collections::ADMIN_LOGS).unwrap(), 2);
        let entries = docs
            .find_by_field(collections::ADMIN_LOGS, "$.kind", "order_timeout")
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body["user_id"], "u-1");
    }
}
