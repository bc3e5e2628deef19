//! # Engine API
//!
//! [`Engine`] is the entry point of the crate. It owns the SQLite connection
//! and the geocoder, and is shared by reference between worker threads
//! (`Engine: Send + Sync`).
//!
//! ## Locking
//!
//! ```text
//!                ┌──────────────────────────────────────┐
//!   worker ──►   │ TableLocks: one RwLock per table id   │  1st
//!                └──────────────────┬───────────────────┘
//!                                   ▼
//!                ┌──────────────────────────────────────┐
//!                │ Mutex<Connection>  (one statement     │  2nd
//!                │ batch / transaction at a time)        │
//!                └──────────────────────────────────────┘
//! ```
//!
//! - Structural changes (columns, roles, rename, destroy) take the table's
//!   write lock
//! - Row reads and writes take the read lock, so they run side by side
//! - Table locks are always taken before the connection, never the other
//!   way around
//! - The connection is never held while a geocoder runs
//!
//! ## Row Writes and Widening
//!
//! ```text
//!   read lock ─► prepare ─► Ready ─► geocode ─► execute (tx) ─► done
//!                   │
//!                   └─► Widen(cols) ─► release read lock
//!                                      write lock ─► widen (tx)
//!                                      retry from the top
//! ```
//!
//! Widening is idempotent: when two writers race to widen the same column,
//! the second finds a `double precision` column and does nothing.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::catalog;
use crate::config::EngineConfig;
use crate::ddl::{self, ColumnChange};
use crate::error::{Error, Result};
use crate::geocoder::{self, Geocoder};
use crate::geometry::{self, resolve_point, GeoPoint, PointUpdate};
use crate::import::{self, import_error, ImportFormat, ImportOptions};
use crate::introspect;
use crate::lifecycle::{self, NewTable};
use crate::rows::{self, GeometryInput, Prepared, PreparedWrite};
use crate::schema::Database;
use crate::storage;
use crate::types::{
    Attributes, ColumnDescriptor, ConstraintDescriptor, ManagedTable, OwnerId, Page, Privacy,
    Row, RowId, RowPage, TableId,
};

/// Prepare/widen rounds before a row write gives up.
const MAX_WRITE_ATTEMPTS: usize = 3;

// =============================================================================
// Table Locks
// =============================================================================

/// Per-table reader/writer locks, created on first use.
#[derive(Default)]
struct TableLocks {
    locks: Mutex<HashMap<TableId, Arc<RwLock<()>>>>,
}

impl TableLocks {
    fn get(&self, id: TableId) -> Arc<RwLock<()>> {
        Arc::clone(self.locks.lock().entry(id).or_default())
    }

    fn remove(&self, id: TableId) {
        self.locks.lock().remove(&id);
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Runtime-mutable tables over one SQLite database.
///
/// # Example
///
/// ```rust
/// use dyntable::{Attributes, Engine, NewTable, OwnerId, Value};
///
/// let engine = Engine::open_in_memory()?;
/// let table = engine.create_table(OwnerId::from_raw(1), &NewTable::named("places"))?;
///
/// let mut row = Attributes::new();
/// row.insert("name".into(), Value::from("Puerta del Sol"));
/// row.insert("latitude".into(), Value::Float(40.4168));
/// row.insert("longitude".into(), Value::Float(-3.7038));
/// let id = engine.insert_row(table.id, &row)?;
///
/// assert!(engine.row_point(table.id, id)?.is_some());
/// # Ok::<(), dyntable::Error>(())
/// ```
pub struct Engine {
    conn: Mutex<Connection>,
    locks: TableLocks,
    geocoder: Arc<dyn Geocoder>,
    config: EngineConfig,
}

impl Engine {
    /// Opens the database described by `config` (in memory without a path)
    /// and builds the configured geocoder.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let db = match &config.database.path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };
        let geocoder = geocoder::from_settings(&config.geocoder)?;
        info!(
            path = ?config.database.path,
            geocoding = config.geocoder.endpoint.is_some(),
            "engine opened"
        );
        Ok(Self {
            conn: Mutex::new(db.into_connection()),
            locks: TableLocks::default(),
            geocoder,
            config,
        })
    }

    /// An in-memory engine with default settings.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(EngineConfig::default())
    }

    /// Replaces the geocoder.
    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` in a transaction, committed on `Ok` and rolled back on `Err`.
    fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs a structural change under the table's write lock.
    fn with_table_tx<T>(
        &self,
        id: TableId,
        f: impl FnOnce(&Connection, &mut ManagedTable) -> Result<T>,
    ) -> Result<T> {
        let lock = self.locks.get(id);
        let _guard = lock.write();
        self.with_tx(|conn| {
            let mut table = catalog::load_table(conn, id)?;
            f(conn, &mut table)
        })
    }

    /// Runs a read under the table's read lock.
    fn with_table<T>(&self, id: TableId, f: impl FnOnce(&Connection, &ManagedTable) -> Result<T>) -> Result<T> {
        let lock = self.locks.get(id);
        let _guard = lock.read();
        self.with_conn(|conn| {
            let table = catalog::load_table(conn, id)?;
            f(conn, &table)
        })
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Creates a table with its backing storage.
    pub fn create_table(&self, owner: OwnerId, new: &NewTable) -> Result<ManagedTable> {
        self.with_tx(|conn| lifecycle::create_table(conn, owner, new))
    }

    pub fn table(&self, id: TableId) -> Result<ManagedTable> {
        self.with_conn(|conn| catalog::load_table(conn, id))
    }

    pub fn list_tables(&self, owner: OwnerId) -> Result<Vec<ManagedTable>> {
        self.with_conn(|conn| catalog::list_tables(conn, owner))
    }

    /// The owner's table counter.
    pub fn owner_table_count(&self, owner: OwnerId) -> Result<u64> {
        self.with_conn(|conn| catalog::owner_table_count(conn, owner))
    }

    pub fn rename_table(&self, id: TableId, display_name: &str) -> Result<ManagedTable> {
        self.with_table_tx(id, |conn, table| {
            lifecycle::rename_table(conn, table, display_name)?;
            Ok(table.clone())
        })
    }

    /// Drops the table, its storage and its tags.
    pub fn destroy_table(&self, id: TableId) -> Result<()> {
        self.with_table_tx(id, |conn, table| lifecycle::destroy_table(conn, table))?;
        self.locks.remove(id);
        Ok(())
    }

    pub fn set_tags(&self, id: TableId, tags: &str) -> Result<ManagedTable> {
        self.with_table_tx(id, |conn, table| {
            lifecycle::set_tags(conn, table, tags)?;
            Ok(table.clone())
        })
    }

    pub fn set_privacy(&self, id: TableId, privacy: Privacy) -> Result<ManagedTable> {
        self.with_table_tx(id, |conn, table| {
            lifecycle::set_privacy(conn, table, privacy)?;
            Ok(table.clone())
        })
    }

    // =========================================================================
    // Structure
    // =========================================================================

    /// The table's visible columns: `row_id`, user columns, timestamps.
    pub fn describe(&self, id: TableId) -> Result<Vec<ColumnDescriptor>> {
        self.with_table(id, introspect::describe)
    }

    pub fn add_column(&self, id: TableId, name: &str, type_name: &str) -> Result<ColumnDescriptor> {
        self.with_table_tx(id, |conn, table| ddl::add_column(conn, table, name, type_name))
    }

    pub fn modify_column(
        &self,
        id: TableId,
        selector: &str,
        change: &ColumnChange,
    ) -> Result<ColumnDescriptor> {
        self.with_table_tx(id, |conn, table| ddl::modify_column(conn, table, selector, change))
    }

    pub fn drop_column(&self, id: TableId, name: &str) -> Result<()> {
        self.with_table_tx(id, |conn, table| ddl::drop_column(conn, table, name))
    }

    /// Named constraints of the table's storage. Takes the table itself so a
    /// destroyed table can still be asked (it reports none).
    pub fn list_constraints(&self, table: &ManagedTable) -> Result<Vec<ConstraintDescriptor>> {
        self.with_conn(|conn| storage::list_constraints(conn, &table.storage_ident()))
    }

    // =========================================================================
    // Geometry Roles
    // =========================================================================

    /// Sets (`Some((lat, lon))`) or clears the lat/lon role.
    pub fn set_lat_lon(&self, id: TableId, columns: Option<(&str, &str)>) -> Result<ManagedTable> {
        self.with_table_tx(id, |conn, table| {
            geometry::assign_lat_lon(conn, table, columns)?;
            Ok(table.clone())
        })
    }

    /// Sets the address role from one column or a comma-joined list, or
    /// clears it with an empty string. Existing rows are geocoded.
    pub fn set_address(&self, id: TableId, spec: &str) -> Result<ManagedTable> {
        let lock = self.locks.get(id);
        let _guard = lock.write();

        let (table, pending) = self.with_tx(|conn| {
            let mut table = catalog::load_table(conn, id)?;
            let pending = geometry::assign_address(conn, &mut table, spec)?;
            Ok((table, pending))
        })?;
        if pending.is_empty() {
            return Ok(table);
        }

        let points: Vec<(RowId, Option<GeoPoint>)> = pending
            .iter()
            .map(|(row_id, address)| (*row_id, geometry::geocode_point(self.geocoder.as_ref(), address)))
            .collect();
        debug!(table_id = id.as_raw(), rows = points.len(), "existing rows geocoded");

        let ident = table.storage_ident();
        self.with_tx(|conn| {
            for (row_id, point) in &points {
                geometry::write_point(conn, &ident, *row_id, *point)?;
            }
            Ok(())
        })?;
        Ok(table)
    }

    /// The stored point of a row, as latitude/longitude.
    pub fn row_point(&self, id: TableId, row_id: RowId) -> Result<Option<GeoPoint>> {
        self.with_table(id, |conn, table| geometry::read_point(conn, table, row_id))
    }

    // =========================================================================
    // Rows
    // =========================================================================

    /// One page of rows; `per_page` defaults to `rows.default_per_page`.
    pub fn list_rows(&self, id: TableId, page: Page) -> Result<RowPage> {
        let per_page = self.config.rows.default_per_page;
        self.with_table(id, |conn, table| rows::list_rows(conn, table, page, per_page))
    }

    pub fn get_row(&self, id: TableId, row_id: RowId) -> Result<Row> {
        self.with_table(id, |conn, table| rows::get_row(conn, table, row_id))
    }

    /// Inserts a row. An empty map inserts a row of defaults.
    pub fn insert_row(&self, id: TableId, attributes: &Attributes) -> Result<RowId> {
        self.write_row(
            id,
            |conn, table| rows::prepare_insert(conn, table, attributes),
            rows::execute_insert,
        )
    }

    pub fn update_row(&self, id: TableId, row_id: RowId, attributes: &Attributes) -> Result<()> {
        self.write_row(
            id,
            |conn, table| rows::prepare_update(conn, table, row_id, attributes),
            |conn, table, write, point| rows::execute_update(conn, table, row_id, write, point),
        )
    }

    /// Changes the point of one row; see [`GeometryInput`].
    pub fn update_geometry(&self, id: TableId, row_id: RowId, input: &GeometryInput) -> Result<()> {
        self.write_row(
            id,
            |conn, table| rows::prepare_geometry_update(conn, table, row_id, input),
            |conn, table, write, point| rows::execute_update(conn, table, row_id, write, point),
        )
    }

    fn write_row<T>(
        &self,
        id: TableId,
        prepare: impl Fn(&Connection, &ManagedTable) -> Result<Prepared>,
        execute: impl Fn(&Connection, &ManagedTable, &PreparedWrite, PointUpdate) -> Result<T>,
    ) -> Result<T> {
        let lock = self.locks.get(id);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let guard = lock.read();
            let (table, prepared) = self.with_conn(|conn| {
                let table = catalog::load_table(conn, id)?;
                let prepared = prepare(conn, &table)?;
                Ok((table, prepared))
            })?;

            match prepared {
                Prepared::Ready(write) => {
                    let point = resolve_point(&write.point, self.geocoder.as_ref());
                    return self.with_tx(|conn| execute(conn, &table, &write, point));
                }
                Prepared::Widen(columns) => {
                    drop(guard);
                    let _guard = lock.write();
                    self.with_tx(|conn| {
                        let mut table = catalog::load_table(conn, id)?;
                        for column in &columns {
                            ddl::widen_column(conn, &mut table, column)?;
                        }
                        Ok(())
                    })?;
                }
            }
        }
        Err(Error::Schema(format!("{id}: write kept requiring widening")))
    }

    // =========================================================================
    // Imports
    // =========================================================================

    /// Creates a table from CSV or JSON read from `reader`.
    ///
    /// # Errors
    ///
    /// Every failure is reported as `Error::Import`; no table is left behind.
    pub fn import_from_reader(
        &self,
        owner: OwnerId,
        reader: impl std::io::Read,
        format: ImportFormat,
        options: &ImportOptions,
    ) -> Result<ManagedTable> {
        let mut source = format.open(reader).map_err(import_error)?;
        let sample_rows = self.config.import.sample_rows;
        self.with_tx(|conn| import::run(conn, owner, source.as_mut(), options, sample_rows))
            .map_err(import_error)
    }

    /// Imports a `.csv` or `.json` file.
    pub fn import_from_file(
        &self,
        owner: OwnerId,
        path: impl AsRef<Path>,
        options: &ImportOptions,
    ) -> Result<ManagedTable> {
        let path = path.as_ref();
        let format = ImportFormat::from_path(path)
            .ok_or_else(|| Error::Import(format!("unsupported file type: {}", path.display())))?;
        let file = File::open(path)
            .map_err(|e| Error::Import(format!("cannot open {}: {e}", path.display())))?;
        self.import_from_reader(owner, file, format, options)
    }

    /// Downloads and imports `url`, bounded by `import.fetch_timeout_ms`.
    pub fn import_from_url(&self, owner: OwnerId, url: &str, options: &ImportOptions) -> Result<ManagedTable> {
        let (format, body) =
            import::fetch(url, self.config.import.fetch_timeout()).map_err(import_error)?;
        self.import_from_reader(owner, body.as_slice(), format, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_engine_is_send_sync() {
        assert_send_sync::<Engine>();
    }

    #[test]
    fn test_table_locks_are_shared_per_id() {
        let locks = TableLocks::default();
        let a = locks.get(TableId::from_raw(1));
        let b = locks.get(TableId::from_raw(1));
        assert!(Arc::ptr_eq(&a, &b));

        locks.remove(TableId::from_raw(1));
        assert!(!Arc::ptr_eq(&a, &locks.get(TableId::from_raw(1))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.rows.default_per_page = 0;
        assert!(matches!(Engine::open(config), Err(Error::Config(_))));
    }
}
