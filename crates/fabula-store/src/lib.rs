//! Dual-store layer: a SQLite-backed JSON document store for mutable state
//! and the relational store for profile/subscription records, plus the
//! manager that owns both, their circuit breakers, and the health probes.

pub mod audit;
pub mod document;
pub mod error;
pub mod journal;
pub mod manager;
pub mod relational;

pub use audit::{AdminLog, AdminLogKind};
pub use document::{collections, Document, DocumentStore};
pub use error::{Result, StoreError};
pub use journal::{JournalEntry, WorkflowJournal, WorkflowStatus};
pub use manager::{DualStoreManager, StoreHealth};
