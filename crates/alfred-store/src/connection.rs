// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;

use alfred_config::Settings;

use crate::migrations;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration lock held by {holder}")]
    MigrationLocked { holder: String },
    #[error("{0}")]
    Invalid(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Open a connection to the configured database file with the standard
/// pragma set.  Creates the parent directory on first use.
pub fn connect(settings: &Settings) -> Result<Connection, StoreError> {
    connect_at(Path::new(&settings.app_db))
}

/// Open a connection to an explicit path with the standard pragma set.
pub fn connect_at(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema applied.  Test-only convenience;
/// each call returns an independent database.
pub fn open_in_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    apply_pragmas(&conn)?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

// WAL keeps readers unblocked under mixed API/worker access; NORMAL sync is
// safe with WAL; busy_timeout absorbs writer contention between the runner
// threads.
fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.pragma_update(None, "busy_timeout", 30_000)?;
    Ok(())
}

/// A cloneable database locator.
///
/// `rusqlite::Connection` is not `Sync`, so long-lived components (task
/// handlers, the orchestrator, tools) never hold one across an await point.
/// They carry a `Db` instead and open short-lived scoped connections; WAL
/// keeps concurrent open/read/write cheap.
#[derive(Clone)]
pub struct Db {
    locator: String,
    use_uri: bool,
    // Keeps a shared-cache in-memory database alive for the Db's lifetime.
    _anchor: Option<std::sync::Arc<std::sync::Mutex<Connection>>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("locator", &self.locator).finish()
    }
}

impl Db {
    /// A file-backed database; the schema is applied on first open.
    pub fn at_path(path: &Path) -> Result<Self, StoreError> {
        let conn = connect_at(path)?;
        crate::migrations::run_migrations(&conn)?;
        Ok(Self {
            locator: path.to_string_lossy().into_owned(),
            use_uri: false,
            _anchor: None,
        })
    }

    /// A process-private shared-cache in-memory database with the schema
    /// applied.  All `open()` calls see the same data; the database lives as
    /// long as any clone of this `Db`.
    pub fn in_memory() -> Result<Self, StoreError> {
        let locator = format!(
            "file:memdb_{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let anchor = Connection::open_with_flags(
            &locator,
            rusqlite::OpenFlags::default() | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        apply_memory_pragmas(&anchor)?;
        crate::migrations::run_migrations(&anchor)?;
        Ok(Self {
            locator,
            use_uri: true,
            _anchor: Some(std::sync::Arc::new(std::sync::Mutex::new(anchor))),
        })
    }

    /// Open a new connection with the standard pragma set.
    pub fn open(&self) -> Result<Connection, StoreError> {
        let conn = if self.use_uri {
            let conn = Connection::open_with_flags(
                &self.locator,
                rusqlite::OpenFlags::default() | rusqlite::OpenFlags::SQLITE_OPEN_URI,
            )?;
            apply_memory_pragmas(&conn)?;
            conn
        } else {
            connect_at(Path::new(&self.locator))?
        };
        Ok(conn)
    }
}

// Shared-cache in-memory databases reject WAL; everything else applies.
fn apply_memory_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 30_000)?;
    Ok(())
}

/// Run `body` inside `BEGIN IMMEDIATE`; commit on Ok, roll back on Err.
///
/// Every public operation that mutates more than one row must go through
/// this helper so a mid-sequence failure never leaves partial state.
pub fn with_tx<T, E>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<rusqlite::Error>,
{
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match body(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
