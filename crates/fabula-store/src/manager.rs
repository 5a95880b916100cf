//! Owner of both stores, their circuit breakers, and the 10 s health probes.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use fabula_core::breaker::CircuitBreaker;
use fabula_core::config::FabulaConfig;
use fabula_core::health::{HealthRegistry, ProbeResult};

use crate::document::DocumentStore;
use crate::error::{Result, StoreError};
use crate::relational;

/// Probe cadence for both stores.
const PROBE_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub document: bool,
    pub relational: bool,
    pub document_latency_ms: u64,
    pub relational_latency_ms: u64,
}

/// How the manager reaches the relational database: a file path in
/// production, a shared-cache URI in tests.
enum RelationalTarget {
    File(String),
    SharedUri(String),
}

pub struct DualStoreManager {
    documents: Arc<DocumentStore>,
    relational: RelationalTarget,
    /// Connection held for probing, separate from subsystem connections.
    probe_conn: Mutex<Connection>,
    doc_breaker: Arc<CircuitBreaker>,
    rel_breaker: Arc<CircuitBreaker>,
}

impl DualStoreManager {
    pub fn open(config: &FabulaConfig) -> Result<Self> {
        let documents = Arc::new(DocumentStore::open(&config.docstore.path)?);
        let probe_conn = relational::open(&config.relational.path)?;
        info!(
            docstore = %config.docstore.path,
            relational = %config.relational.path,
            "dual store opened"
        );
        Ok(Self {
            documents,
            relational: RelationalTarget::File(config.relational.path.clone()),
            probe_conn: Mutex::new(probe_conn),
            doc_breaker: Arc::new(CircuitBreaker::new("docstore")),
            rel_breaker: Arc::new(CircuitBreaker::new("relational")),
        })
    }

    /// Fully in-memory pair for tests. The relational side uses a
    /// shared-cache URI so subsystem connections see the same data; the
    /// manager's probe connection keeps the database alive.
    pub fn in_memory() -> Result<Self> {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let uri = format!("file:fabula_rel_{}?mode=memory&cache=shared", tag);
        let documents = Arc::new(DocumentStore::open_in_memory()?);
        let probe_conn = relational::open_shared(&uri)?;
        Ok(Self {
            documents,
            relational: RelationalTarget::SharedUri(uri),
            probe_conn: Mutex::new(probe_conn),
            doc_breaker: Arc::new(CircuitBreaker::new("docstore")),
            rel_breaker: Arc::new(CircuitBreaker::new("relational")),
        })
    }

    pub fn documents(&self) -> Arc<DocumentStore> {
        Arc::clone(&self.documents)
    }

    /// Open a fresh relational connection for a subsystem.
    pub fn open_relational(&self) -> Result<Connection> {
        match &self.relational {
            RelationalTarget::File(path) => relational::open(path),
            RelationalTarget::SharedUri(uri) => relational::open_shared(uri),
        }
    }

    /// Run `f` inside an ACID transaction on the manager's own relational
    /// connection. Subsystems with their own connection (registry,
    /// subscriptions) manage their statements directly; this is for
    /// multi-statement admin work.
    pub fn relational_txn<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.probe_conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn doc_breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.doc_breaker)
    }

    pub fn rel_breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.rel_breaker)
    }

    /// Fail-fast guard for document writes; consulted before transactional
    /// paths so an open breaker surfaces as `Degraded` instead of a timeout.
    pub fn guard_document_write(&self) -> Result<()> {
        if self.doc_breaker.allow() {
            Ok(())
        } else {
            Err(StoreError::Degraded {
                dependency: "docstore",
            })
        }
    }

    /// Probe both stores once and record the outcome on the breakers.
    pub fn health(&self) -> StoreHealth {
        let (doc_up, doc_ms) = match self.documents.ping() {
            Ok(ms) => {
                self.doc_breaker.record_success();
                (true, ms)
            }
            Err(e) => {
                self.doc_breaker.record_failure();
                error!(error = %e, "document store probe failed");
                (false, 0)
            }
        };

        let (rel_up, rel_ms) = {
            let conn = self.probe_conn.lock().unwrap();
            match relational::ping(&conn) {
                Ok(ms) => {
                    self.rel_breaker.record_success();
                    (true, ms)
                }
                Err(e) => {
                    self.rel_breaker.record_failure();
                    error!(error = %e, "relational store probe failed");
                    (false, 0)
                }
            }
        };

        StoreHealth {
            document: doc_up,
            relational: rel_up,
            document_latency_ms: doc_ms,
            relational_latency_ms: rel_ms,
        }
    }

    /// Periodic probe loop. Runs until `shutdown` broadcasts `true`.
    pub async fn run_probes(
        self: Arc<Self>,
        registry: Arc<HealthRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("store health probes started");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(PROBE_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let health = self.health();
                    registry.record(
                        "docstore",
                        if health.document {
                            ProbeResult::up(health.document_latency_ms)
                        } else {
                            ProbeResult::down("probe failed")
                        },
                    );
                    registry.record(
                        "relational",
                        if health.relational {
                            ProbeResult::up(health.relational_latency_ms)
                        } else {
                            ProbeResult::down("probe failed")
                        },
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("store health probes shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_pair_is_healthy() {
        let mgr = DualStoreManager::in_memory().unwrap();
        let health = mgr.health();
        assert!(health.document);
        assert!(health.relational);
    }

    #[test]
    fn relational_connections_share_data() {
        let mgr = DualStoreManager::in_memory().unwrap();
        let a = mgr.open_relational().unwrap();
        a.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();

        let b = mgr.open_relational().unwrap();
        let x: i64 = b.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(x, 7);
    }

    #[test]
    fn relational_txn_rolls_back_on_error() {
        let mgr = DualStoreManager::in_memory().unwrap();
        mgr.relational_txn(|tx| {
            tx.execute_batch("CREATE TABLE t (x INTEGER)")?;
            Ok(())
        })
        .unwrap();

        let result: Result<()> = mgr.relational_txn(|tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])?;
            tx.execute("INSERT INTO missing_table VALUES (1)", [])?;
            Ok(())
        });
        assert!(result.is_err());

        let count: i64 = mgr
            .relational_txn(|tx| {
                Ok(tx.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn write_guard_follows_breaker() {
        let mgr = DualStoreManager::in_memory().unwrap();
        assert!(mgr.guard_document_write().is_ok());
        for _ in 0..5 {
            mgr.doc_breaker().record_failure();
        }
        let err = mgr.guard_document_write().unwrap_err();
        assert_eq!(err.code(), "SERVICE_DEGRADED");
    }
}
