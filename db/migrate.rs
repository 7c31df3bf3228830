// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Brings a database file from whatever `schema_version` it has up to
//! [`schema::CURRENT_VERSION`], running each script in [`schema::MIGRATIONS`]
//! in order inside its own transaction.

use crate::schema;
use base::{bail, Error};
use rusqlite::Connection;
use tracing::info;

fn current_version(conn: &Connection) -> rusqlite::Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |_| Ok(true),
    ).unwrap_or(false);
    if !exists {
        return Ok(0);
    }
    conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
}

/// Runs every migration newer than the database's current version.
///
/// Safe to call on every startup: a database already at
/// [`schema::CURRENT_VERSION`] runs zero migrations.
pub fn upgrade(conn: &mut Connection) -> Result<(), Error> {
    let from = current_version(conn)?;
    if from > schema::CURRENT_VERSION {
        bail!(
            FailedPrecondition,
            "database schema version {} is newer than this binary understands ({})",
            from,
            schema::CURRENT_VERSION
        );
    }
    for &(version, script) in schema::MIGRATIONS {
        if version <= from {
            continue;
        }
        info!(version, "applying database migration");
        let tx = conn.transaction()?;
        tx.execute_batch(script)?;
        tx.commit()?;
    }
    Ok(())
}

/// Opens (creating if necessary) a database at `path`, enables WAL mode, and
/// runs [`upgrade`].
///
/// Every writer in the process shares a single [`Connection`] behind a
/// mutex (see `crate::testutil`/the caller's connection pool); sqlite's WAL
/// mode still lets readers proceed concurrently with that one writer.
pub fn open(path: &std::path::Path) -> Result<Connection, Error> {
    let mut conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "foreign_keys", true)?;
    upgrade(&mut conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_lands_on_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        upgrade(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), schema::CURRENT_VERSION);
    }

    #[test]
    fn upgrade_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        upgrade(&mut conn).unwrap();
        upgrade(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), schema::CURRENT_VERSION);
    }

    #[test]
    fn future_version_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        upgrade(&mut conn).unwrap();
        conn.execute("UPDATE schema_version SET version = version + 1", []).unwrap();
        let mut conn2 = conn;
        assert!(upgrade(&mut conn2).is_err());
    }
}
