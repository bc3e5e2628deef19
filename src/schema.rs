//! # Catalog Schema for dyntable
//!
//! This module defines the catalog tables and handles initialization. The
//! catalog is the bookkeeping kept *about* managed tables; the managed tables
//! themselves are ordinary SQLite tables created at runtime by the DDL layer.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Catalog Overview                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  owners                 managed_tables              tags                │
//! │  ┌──────────────┐       ┌──────────────────┐       ┌──────────────┐     │
//! │  │ owner_id (PK)│◄──────│ owner_id         │       │ tag_id (PK)  │     │
//! │  │ tables_count │       │ table_id (PK)    │◄──────│ table_id     │     │
//! │  └──────────────┘       │ name, display    │       │ owner_id     │     │
//! │                         │ privacy          │       │ name         │     │
//! │                         │ rows_counted     │       └──────────────┘     │
//! │                         │ role columns     │                            │
//! │                         └──────────────────┘                            │
//! │                                                                         │
//! │  u{owner}_{name}   one backing table per managed table                  │
//! │  ┌────────┬──────────────┬──────────┬────────────┬────────────┐         │
//! │  │ row_id │ user columns │ the_geom │ created_at │ updated_at │         │
//! │  └────────┴──────────────┴──────────┴────────────┴────────────┘         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why counters in the catalog?
//!
//! `tables_count` and `rows_counted` are denormalized so listings don't scan
//! every backing table. Both are written in the same transaction as the change
//! they describe; `tables_count` is re-derived with `COUNT(*)` rather than
//! incremented, so it can't drift.
//!
//! ### Why role columns by name?
//!
//! Geometry roles point at columns by name. SQLite has no stable column ids
//! across a table rebuild, and the role state machine already rewrites the
//! pointers on every rename.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current catalog version. Increment when making breaking catalog changes.
///
/// There are no migrations: a mismatching database is refused.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Per-owner bookkeeping.
///
/// Owners are created lazily on their first table. `tables_count` always
/// equals the number of `managed_tables` rows of the owner.
const CREATE_OWNERS: &str = r#"
CREATE TABLE IF NOT EXISTS owners (
    owner_id     INTEGER PRIMARY KEY,
    tables_count INTEGER NOT NULL DEFAULT 0
)
"#;

/// One row per managed table.
///
/// # Columns
///
/// - `name`: storage name, unique per owner, used to build the backing
///   table identifier `u{owner_id}_{name}`
/// - `display_name`: what the user asked for
/// - `privacy`: 0 = private, 1 = public
/// - `lat_column` / `lon_column`: the lat/lon role, both set or both null
/// - `address_column`: the address role
/// - `address_sources`: comma-joined source columns of an aggregated address
const CREATE_MANAGED_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS managed_tables (
    table_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id        INTEGER NOT NULL,
    name            TEXT NOT NULL,
    display_name    TEXT NOT NULL,
    privacy         INTEGER NOT NULL DEFAULT 0,
    rows_counted    INTEGER NOT NULL DEFAULT 0,
    lat_column      TEXT,
    lon_column      TEXT,
    address_column  TEXT,
    address_sources TEXT,
    created_ms      INTEGER NOT NULL,
    updated_ms      INTEGER NOT NULL,
    UNIQUE (owner_id, name)
)
"#;

/// Tags attached to managed tables. A tag exists only while some table
/// references it, so there is one row per (name, table).
const CREATE_TAGS: &str = r#"
CREATE TABLE IF NOT EXISTS tags (
    tag_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name     TEXT NOT NULL,
    owner_id INTEGER NOT NULL,
    table_id INTEGER NOT NULL,
    UNIQUE (name, table_id)
)
"#;

const CREATE_TAGS_OWNER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS tags_owner
ON tags(owner_id, name)
"#;

/// Key/value metadata, currently only the catalog version.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS dyntable_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the catalog initialized.
///
/// # Rust Pattern: Newtype Wrapper
///
/// Only a `Database` can produce a connection for the engine, so every
/// connection the engine uses has gone through [`Database::initialize`].
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the catalog version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use dyntable::Database;
    ///
    /// let db = Database::open("tables.db")?;
    /// # Ok::<(), dyntable::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize(true)?;
        Ok(db)
    }

    /// Creates an in-memory database.
    ///
    /// ```rust
    /// use dyntable::Database;
    ///
    /// let db = Database::open_in_memory()?;
    /// # Ok::<(), dyntable::Error>(())
    /// ```
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(false)?;
        Ok(db)
    }

    /// Creates the catalog tables and checks the version.
    fn initialize(&mut self, on_disk: bool) -> Result<()> {
        // WAL only means something for a file; in-memory databases keep
        // their own journal mode.
        if on_disk {
            self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
            self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        }
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_OWNERS)?;
        self.conn.execute_batch(CREATE_MANAGED_TABLES)?;
        self.conn.execute_batch(CREATE_TAGS)?;
        self.conn.execute_batch(CREATE_TAGS_OWNER_INDEX)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the catalog version, or sets it on a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = self
            .conn
            .query_row(
                "SELECT value FROM dyntable_metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO dyntable_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this dyntable version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Hands the initialized connection over to the engine.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");

        let count: i32 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .expect("should query tables");

        // metadata, owners, managed_tables, tags
        assert_eq!(count, 4, "expected 4 catalog tables");
    }

    /// Reopening a file must find the version it wrote.
    #[test]
    fn test_reopen_keeps_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).expect("reopen should succeed");

        let version: String = db
            .conn
            .query_row(
                "SELECT value FROM dyntable_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_version_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        let db = Database::open(&path).unwrap();
        db.conn
            .execute(
                "UPDATE dyntable_metadata SET value = '99' WHERE key = 'schema_version'",
                [],
            )
            .unwrap();
        drop(db);

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
