//! Relational store bootstrap.
//!
//! Table DDL lives with the subsystems that own it (fabula-users owns
//! `user_profiles` and `subscriptions`); this module only opens connections
//! with consistent pragmas and provides the health probe.

use std::path::Path;
use std::time::Instant;

use rusqlite::{Connection, OpenFlags};

use crate::error::Result;

/// Open a connection to the relational database at `path`.
///
/// Each subsystem opens its own connection so one busy writer cannot starve
/// the rest behind a single mutex.
pub fn open(path: &str) -> Result<Connection> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

/// Shared-cache in-memory database addressable by URI, for tests that need
/// several connections over the same data.
pub fn open_shared(uri: &str) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI,
    )?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(10))?;
    Ok(())
}

/// Round-trip latency of a trivial query, in ms.
pub fn ping(conn: &Connection) -> Result<u64> {
    let started = Instant::now();
    conn.query_row("SELECT 1", [], |_| Ok(()))?;
    Ok(started.elapsed().as_millis() as u64)
}
