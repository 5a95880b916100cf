//! Workflow journal: multi-step workflows checkpoint here so an interrupted
//! run can be found and compensated after a restart.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{to_value, Value};
use tracing::warn;
use uuid::Uuid;

use crate::document::{collections, DocumentStore};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Completed,
    Failed,
}

/// One journaled workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub workflow_id: String,
    /// Workflow kind, e.g. "pista_purchase".
    pub kind: String,
    pub user_id: String,
    /// Last step reached, e.g. "debit", "unlock".
    pub step: String,
    pub checkpoint: Value,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct WorkflowJournal {
    docs: Arc<DocumentStore>,
}

impl WorkflowJournal {
    pub fn new(docs: Arc<DocumentStore>) -> Self {
        Self { docs }
    }

    /// Open a new in-progress workflow at its first step.
    pub fn begin(
        &self,
        kind: &str,
        user_id: &str,
        step: &str,
        checkpoint: Value,
    ) -> Result<JournalEntry> {
        let now = Utc::now().to_rfc3339();
        let entry = JournalEntry {
            workflow_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            user_id: user_id.to_string(),
            step: step.to_string(),
            checkpoint,
            status: WorkflowStatus::InProgress,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.docs.insert(
            collections::WORKFLOWS_JOURNAL,
            &entry.workflow_id,
            &to_value(&entry)?,
        )?;
        Ok(entry)
    }

    /// Record that a workflow reached `step`.
    pub fn checkpoint(&self, workflow_id: &str, step: &str, checkpoint: Value) -> Result<()> {
        self.update(workflow_id, |entry| {
            entry.step = step.to_string();
            entry.checkpoint = checkpoint.clone();
        })
    }

    pub fn complete(&self, workflow_id: &str) -> Result<()> {
        self.update(workflow_id, |entry| {
            entry.status = WorkflowStatus::Completed;
        })
    }

    pub fn fail(&self, workflow_id: &str, error: &str) -> Result<()> {
        self.update(workflow_id, |entry| {
            entry.status = WorkflowStatus::Failed;
            entry.error = Some(error.to_string());
        })
    }

    /// Workflows that never finished; consulted on startup for replay.
    pub fn incomplete(&self) -> Result<Vec<JournalEntry>> {
        let docs = self
            .docs
            .find_by_field(collections::WORKFLOWS_JOURNAL, "$.status", "in_progress")?;
        Ok(docs
            .into_iter()
            .filter_map(|d| serde_json::from_value(d.body).ok())
            .collect())
    }

    /// Drop completed workflows; they only matter until archival.
    pub fn prune_completed(&self) -> Result<usize> {
        let done = self
            .docs
            .find_by_field(collections::WORKFLOWS_JOURNAL, "$.status", "completed")?;
        let mut pruned = 0;
        for doc in done {
            if self.docs.delete(collections::WORKFLOWS_JOURNAL, &doc.id)? {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    fn update(&self, workflow_id: &str, mutate: impl Fn(&mut JournalEntry)) -> Result<()> {
        let Some(doc) = self.docs.get(collections::WORKFLOWS_JOURNAL, workflow_id)? else {
            warn!(workflow_id, "journal update for unknown workflow");
            return Ok(());
        };
        let mut entry: JournalEntry = serde_json::from_value(doc.body)?;
        mutate(&mut entry);
        entry.updated_at = Utc::now().to_rfc3339();
        self.docs.compare_and_put(
            collections::WORKFLOWS_JOURNAL,
            workflow_id,
            doc.version,
            &to_value(&entry)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_reaches_completed() {
        let docs = Arc::new(DocumentStore::open_in_memory().unwrap());
        let journal = WorkflowJournal::new(Arc::clone(&docs));

        let entry = journal
            .begin("pista_purchase", "u-1", "debit", json!({"hint_id": "h-1"}))
            .unwrap();
        assert_eq!(journal.incomplete().unwrap().len(), 1);

        journal
            .checkpoint(&entry.workflow_id, "unlock", json!({"hint_id": "h-1"}))
            .unwrap();
        journal.complete(&entry.workflow_id).unwrap();
        assert!(journal.incomplete().unwrap().is_empty());

        assert_eq!(journal.prune_completed().unwrap(), 1);
        assert!(docs
            .get(collections::WORKFLOWS_JOURNAL, &entry.workflow_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn failed_workflows_stay_visible() {
        let docs = Arc::new(DocumentStore::open_in_memory().unwrap());
        let journal = WorkflowJournal::new(docs);

        let entry = journal
            .begin("pista_purchase", "u-1", "debit", json!({}))
            .unwrap();
        journal.fail(&entry.workflow_id, "unlock failed").unwrap();

        assert!(journal.incomplete().unwrap().is_empty());
        assert_eq!(journal.prune_completed().unwrap(), 0);
    }
}
