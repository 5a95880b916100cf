//! JSON document store over SQLite.
//!
//! One `documents` table holds every collection: JSON bodies in a TEXT
//! column, an integer `version` for optimistic concurrency, and JSON1
//! (`json_extract`) for secondary lookups. Multi-document writes run inside
//! a real SQLite transaction via [`DocumentStore::txn`].

use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Collection names used across the workspace, centralised so a typo cannot
/// silently create a new collection.
pub mod collections {
    pub const USERS: &str = "users";
    pub const NARRATIVE_FRAGMENTS: &str = "narrative_fragments";
    pub const ITEMS: &str = "items";
    pub const HINTS: &str = "hints";
    pub const MISSIONS: &str = "missions";
    pub const CURRENCY_TRANSACTIONS: &str = "currency_transactions";
    pub const EVENTS_AUDIT: &str = "events_audit";
    pub const WORKFLOWS_JOURNAL: &str = "workflows_journal";
    pub const SCHEDULED_POSTS: &str = "scheduled_posts";
    pub const ADMIN_LOGS: &str = "admin_logs";
    pub const MESSAGE_TRACKING: &str = "message_tracking";
    pub const DEAD_LETTERS: &str = "dead_letters";
}

/// A stored document plus its concurrency token.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub version: i64,
    pub body: Value,
    pub updated_at: String,
}

pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    /// Open (and initialise) the document database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Shared-cache in-memory store addressable by URI, so several
    /// connections in one test process can see the same data.
    pub fn open_shared(uri: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock().unwrap();
        get_doc(&conn, collection, id)
    }

    /// Insert a new document at version 1. Fails with `AlreadyExists` when
    /// the id is taken.
    pub fn insert(&self, collection: &str, id: &str, body: &Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        insert_doc(&conn, collection, id, body)
    }

    /// Unconditional write, used for read-mostly content seeding. Creates the
    /// document when absent, otherwise replaces the body and bumps the version.
    pub fn put(&self, collection: &str, id: &str, body: &Value) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        put_doc(&conn, collection, id, body)
    }

    /// Optimistic-concurrency replace: succeeds only when the stored version
    /// still equals `expected_version`. Returns the new version.
    pub fn compare_and_put(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        body: &Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        compare_and_put_doc(&conn, collection, id, expected_version, body)
    }

    /// Delete a document. Returns whether it existed.
    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        delete_doc(&conn, collection, id)
    }

    /// Equality lookup on a JSON field, e.g. `find_by_field("missions",
    /// "$.user_id", "u-1")`.
    pub fn find_by_field(&self, collection: &str, json_path: &str, value: &str) -> Result<Vec<Document>> {
        let conn = self.conn.lock().unwrap();
        find_docs(&conn, collection, json_path, value)
    }

    pub fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, version, body, updated_at FROM documents
             WHERE collection = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![collection], row_to_doc)?;
        collect_docs(rows)
    }

    pub fn count(&self, collection: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Run `f` inside a single SQLite transaction. Rolls back on error.
    pub fn txn<T>(&self, f: impl FnOnce(&DocTxn<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&DocTxn { tx: &tx });
        match out {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "document transaction rolled back");
                Err(e)
            }
        }
    }

    /// Liveness probe: round-trip latency of a trivial query, in ms.
    pub fn ping(&self) -> Result<u64> {
        let started = Instant::now();
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(started.elapsed().as_millis() as u64)
    }
}

/// Transactional view over the document table. All operations share the
/// surrounding transaction and commit or roll back together.
pub struct DocTxn<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl DocTxn<'_> {
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        get_doc(self.tx, collection, id)
    }

    pub fn insert(&self, collection: &str, id: &str, body: &Value) -> Result<()> {
        insert_doc(self.tx, collection, id, body)
    }

    pub fn put(&self, collection: &str, id: &str, body: &Value) -> Result<i64> {
        put_doc(self.tx, collection, id, body)
    }

    pub fn compare_and_put(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        body: &Value,
    ) -> Result<i64> {
        compare_and_put_doc(self.tx, collection, id, expected_version, body)
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        delete_doc(self.tx, collection, id)
    }

    pub fn find_by_field(&self, collection: &str, json_path: &str, value: &str) -> Result<Vec<Document>> {
        find_docs(self.tx, collection, json_path, value)
    }
}

// ---------------------------------------------------------------------------
// Shared SQL helpers (used by both the store and its transactional view)
// ---------------------------------------------------------------------------

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS documents (
            collection  TEXT NOT NULL,
            id          TEXT NOT NULL,
            body        TEXT NOT NULL,
            version     INTEGER NOT NULL DEFAULT 1,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        );",
    )?;
    Ok(())
}

fn row_to_doc(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn collect_docs(
    rows: impl Iterator<Item = rusqlite::Result<(String, i64, String, String)>>,
) -> Result<Vec<Document>> {
    let mut out = Vec::new();
    for row in rows {
        let (id, version, body, updated_at) = row?;
        out.push(Document {
            id,
            version,
            body: serde_json::from_str(&body)?,
            updated_at,
        });
    }
    Ok(out)
}

fn get_doc(conn: &Connection, collection: &str, id: &str) -> Result<Option<Document>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, version, body, updated_at FROM documents
         WHERE collection = ?1 AND id = ?2",
    )?;
    match stmt.query_row(params![collection, id], row_to_doc) {
        Ok((id, version, body, updated_at)) => Ok(Some(Document {
            id,
            version,
            body: serde_json::from_str(&body)?,
            updated_at,
        })),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Database(e)),
    }
}

fn insert_doc(conn: &Connection, collection: &str, id: &str, body: &Value) -> Result<()> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO documents (collection, id, body, version, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4)",
        params![collection, id, body.to_string(), Utc::now().to_rfc3339()],
    )?;
    if n == 0 {
        return Err(StoreError::AlreadyExists {
            collection: collection.to_string(),
            id: id.to_string(),
        });
    }
    Ok(())
}

fn put_doc(conn: &Connection, collection: &str, id: &str, body: &Value) -> Result<i64> {
    conn.execute(
        "INSERT INTO documents (collection, id, body, version, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT (collection, id) DO UPDATE
         SET body = excluded.body,
             version = documents.version + 1,
             updated_at = excluded.updated_at",
        params![collection, id, body.to_string(), Utc::now().to_rfc3339()],
    )?;
    let version: i64 = conn.query_row(
        "SELECT version FROM documents WHERE collection = ?1 AND id = ?2",
        params![collection, id],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn compare_and_put_doc(
    conn: &Connection,
    collection: &str,
    id: &str,
    expected_version: i64,
    body: &Value,
) -> Result<i64> {
    let n = conn.execute(
        "UPDATE documents
         SET body = ?4, version = version + 1, updated_at = ?5
         WHERE collection = ?1 AND id = ?2 AND version = ?3",
        params![
            collection,
            id,
            expected_version,
            body.to_string(),
            Utc::now().to_rfc3339()
        ],
    )?;
    if n == 0 {
        // Distinguish a missing document from a stale version.
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |_| Ok(true),
            )
            .unwrap_or(false);
        return Err(if exists {
            StoreError::VersionConflict {
                collection: collection.to_string(),
                id: id.to_string(),
                expected: expected_version,
            }
        } else {
            StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }
        });
    }
    Ok(expected_version + 1)
}

fn delete_doc(conn: &Connection, collection: &str, id: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
        params![collection, id],
    )?;
    Ok(n > 0)
}

fn find_docs(conn: &Connection, collection: &str, json_path: &str, value: &str) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, version, body, updated_at FROM documents
         WHERE collection = ?1 AND json_extract(body, ?2) = ?3
         ORDER BY id",
    )?;
    let rows = stmt.query_map(params![collection, json_path, value], row_to_doc)?;
    collect_docs(rows)
}
