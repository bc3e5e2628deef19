//! # Row Access Layer
//!
//! Paginated reads and validated writes against a backing table.
//!
//! ## Two-Phase Writes
//!
//! A write is split so that geocoding never happens with the connection
//! locked:
//!
//! ```text
//!  prepare_*  ──► Prepared::Widen(cols)   caller widens under the table's
//!     │                                   write lock, then prepares again
//!     │
//!     └─────► Prepared::Ready(write)
//!                    │
//!              resolve_point (geocoder, no connection held)
//!                    │
//!              execute_* (one transaction)
//! ```
//!
//! ## Validation
//!
//! - Keys naming unknown, reserved, or hidden columns reject the whole write
//!   with `InvalidAttributes`, listing every offending key
//! - Values are coerced to the column type; fractional numbers headed for
//!   integer columns ask for widening, anything else that doesn't fit is a
//!   `Cast` error
//! - Empty strings written to non-text columns are stored as null

use std::collections::HashMap;

use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use crate::catalog;
use crate::codec::{coerce_for_write, present, to_sql, Coerced};
use crate::ddl;
use crate::error::{Error, Result};
use crate::geometry::{aggregate_address, point_from_values, point_source, PointSource, PointUpdate};
use crate::introspect;
use crate::storage::{self, quote_ident};
use crate::types::{
    Attributes, ColumnDescriptor, ManagedTable, Page, Row, RowId, RowPage, Value,
    GEOMETRY_COLUMN, ROW_ID_COLUMN, UPDATED_AT_COLUMN,
};

/// Passes through prepare → widen before giving up on a write.
const MAX_WIDEN_PASSES: usize = 3;

// =============================================================================
// Reads
// =============================================================================

fn select_list(columns: &[ColumnDescriptor]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_row(columns: &[ColumnDescriptor], row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        values.push((column.name.clone(), present(row.get(i)?, column.internal_type)));
    }
    let id = match values.first() {
        Some((_, Value::Integer(id))) => *id,
        _ => 0,
    };
    Ok(Row { id: RowId::from_raw(id), values })
}

/// One page of rows in row id order, plus the live row count.
pub fn list_rows(
    conn: &Connection,
    table: &ManagedTable,
    page: Page,
    default_per_page: u32,
) -> Result<RowPage> {
    let columns = introspect::describe(conn, table)?;
    let ident = table.storage_ident();
    let per_page = page.per_page.unwrap_or(default_per_page).max(1);
    let offset = u64::from(page.page) * u64::from(per_page);

    let rows = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT ? OFFSET ?",
            select_list(&columns),
            quote_ident(&ident),
            quote_ident(ROW_ID_COLUMN)
        ))?;
        let rows = stmt
            .query_map([i64::from(per_page), offset as i64], |row| read_row(&columns, row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    Ok(RowPage { rows, total_rows: storage::count_rows(conn, &ident)? })
}

/// Reads one row.
///
/// # Errors
///
/// `Error::NotFound` for an unknown row id.
pub fn get_row(conn: &Connection, table: &ManagedTable, row_id: RowId) -> Result<Row> {
    let columns = introspect::describe(conn, table)?;
    get_row_with(conn, table, &columns, row_id)
}

fn get_row_with(
    conn: &Connection,
    table: &ManagedTable,
    columns: &[ColumnDescriptor],
    row_id: RowId,
) -> Result<Row> {
    conn.query_row(
        &format!(
            "SELECT {} FROM {} WHERE {} = ?",
            select_list(columns),
            quote_ident(&table.storage_ident()),
            quote_ident(ROW_ID_COLUMN)
        ),
        [row_id.as_raw()],
        |row| read_row(columns, row),
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("{row_id} in {}", table.id)))
}

// =============================================================================
// Preparation
// =============================================================================

/// A validated, typed write plus where its point comes from.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedWrite {
    pub values: Vec<(String, Value)>,
    pub point: PointSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    Ready(PreparedWrite),
    /// Integer columns that must become `double precision` first.
    Widen(Vec<String>),
}

/// Explicit geometry input for [`prepare_geometry_update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometryInput {
    pub latitude: Option<Value>,
    pub longitude: Option<Value>,
    pub address: Option<String>,
}

impl GeometryInput {
    pub fn lat_lon(lat: impl Into<Value>, lon: impl Into<Value>) -> Self {
        Self {
            latitude: Some(lat.into()),
            longitude: Some(lon.into()),
            address: None,
        }
    }

    pub fn address(address: impl Into<String>) -> Self {
        Self { address: Some(address.into()), ..Self::default() }
    }
}

fn writable_columns(columns: &[ColumnDescriptor]) -> HashMap<&str, &ColumnDescriptor> {
    columns
        .iter()
        .filter(|c| !c.is_reserved())
        .map(|c| (c.name.as_str(), c))
        .collect()
}

/// Validates keys and coerces values. Returns the typed values, or the
/// columns needing widening.
fn coerce_attributes(
    columns: &[ColumnDescriptor],
    attributes: &Attributes,
) -> Result<std::result::Result<Vec<(String, Value)>, Vec<String>>> {
    let writable = writable_columns(columns);
    let unknown: Vec<String> = attributes
        .keys()
        .filter(|k| !writable.contains_key(k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(Error::InvalidAttributes(unknown));
    }

    let mut values = Vec::with_capacity(attributes.len());
    let mut widen = Vec::new();
    for (name, value) in attributes {
        let column = writable[name.as_str()];
        match coerce_for_write(value, column.internal_type) {
            Some(Coerced::Value(v)) => values.push((name.clone(), v)),
            Some(Coerced::NeedsWidening) => widen.push(name.clone()),
            None => {
                return Err(Error::Cast {
                    column: name.clone(),
                    value: value.to_text(),
                    target: column.internal_type.sql_name(),
                })
            }
        }
    }
    Ok(if widen.is_empty() { Ok(values) } else { Err(widen) })
}

/// Sets the aggregated address from its sources in `merged`, when the table
/// has one.
fn refresh_aggregated_address(table: &ManagedTable, merged: &mut HashMap<String, Value>) -> bool {
    let Some(address) = &table.roles.address else { return false };
    if table.roles.address_sources.is_empty() {
        return false;
    }
    let parts: Vec<Value> = table
        .roles
        .address_sources
        .iter()
        .map(|s| merged.get(s).cloned().unwrap_or(Value::Null))
        .collect();
    let joined = aggregate_address(&parts);
    let value = if joined.is_empty() { Value::Null } else { Value::Text(joined) };
    merged.insert(address.clone(), value);
    true
}

fn finish_write(
    table: &ManagedTable,
    mut values: Vec<(String, Value)>,
    mut merged: HashMap<String, Value>,
    recompute_point: bool,
) -> PreparedWrite {
    if refresh_aggregated_address(table, &mut merged) {
        if let Some(address) = &table.roles.address {
            let aggregated = merged.get(address).cloned().unwrap_or(Value::Null);
            values.retain(|(name, _)| name != address);
            values.push((address.clone(), aggregated));
        }
    }

    let point = if recompute_point && table.roles.any() {
        point_source(&table.roles, |c| merged.get(c).cloned().unwrap_or(Value::Null))
    } else {
        PointSource::Keep
    };
    PreparedWrite { values, point }
}

/// Validates an insert. An empty attribute map inserts an all-default row.
pub fn prepare_insert(
    conn: &Connection,
    table: &ManagedTable,
    attributes: &Attributes,
) -> Result<Prepared> {
    let columns = introspect::describe(conn, table)?;
    prepare_insert_with(&columns, table, attributes)
}

fn prepare_insert_with(
    columns: &[ColumnDescriptor],
    table: &ManagedTable,
    attributes: &Attributes,
) -> Result<Prepared> {
    let values = match coerce_attributes(columns, attributes)? {
        Ok(values) => values,
        Err(widen) => return Ok(Prepared::Widen(widen)),
    };
    let merged: HashMap<String, Value> = values.iter().cloned().collect();
    Ok(Prepared::Ready(finish_write(table, values, merged, true)))
}

/// Validates an update of an existing row.
///
/// The point is recomputed only when a column feeding it is written.
pub fn prepare_update(
    conn: &Connection,
    table: &ManagedTable,
    row_id: RowId,
    attributes: &Attributes,
) -> Result<Prepared> {
    let columns = introspect::describe(conn, table)?;
    let values = match coerce_attributes(&columns, attributes)? {
        Ok(values) => values,
        Err(widen) => return Ok(Prepared::Widen(widen)),
    };
    let current = get_row_with(conn, table, &columns, row_id)?;

    let mut merged: HashMap<String, Value> = current.values.into_iter().collect();
    merged.extend(values.iter().cloned());

    let sources = table.roles.source_columns();
    let touches_point = values.iter().any(|(name, _)| sources.contains(&name.as_str()));
    Ok(Prepared::Ready(finish_write(table, values, merged, touches_point)))
}

/// Validates an explicit geometry change of one row.
///
/// A latitude/longitude pair sets the point directly; otherwise an address
/// is geocoded; with neither, the point is recomputed from the row. Supplied
/// values are written to the matching role columns only.
pub fn prepare_geometry_update(
    conn: &Connection,
    table: &ManagedTable,
    row_id: RowId,
    input: &GeometryInput,
) -> Result<Prepared> {
    let columns = introspect::describe(conn, table)?;
    let current = get_row_with(conn, table, &columns, row_id)?;

    let mut attributes = Attributes::new();
    let targets = [
        (&table.roles.latitude, input.latitude.clone()),
        (&table.roles.longitude, input.longitude.clone()),
        (&table.roles.address, input.address.clone().map(Value::Text)),
    ];
    for (column, value) in targets {
        if let (Some(column), Some(value)) = (column, value) {
            attributes.insert(column.clone(), value);
        }
    }

    let values = match coerce_attributes(&columns, &attributes)? {
        Ok(values) => values,
        Err(widen) => return Ok(Prepared::Widen(widen)),
    };
    let mut merged: HashMap<String, Value> = current.values.into_iter().collect();
    merged.extend(values.iter().cloned());

    let point = match (&input.latitude, &input.longitude, &input.address) {
        (Some(lat), Some(lon), _) => {
            PointSource::Direct(point_from_values(lat, lon))
        }
        (_, _, Some(address)) if address.trim().is_empty() => PointSource::Direct(None),
        (_, _, Some(address)) => PointSource::Address(address.trim().to_string()),
        _ => point_source(&table.roles, |c| merged.get(c).cloned().unwrap_or(Value::Null)),
    };
    Ok(Prepared::Ready(PreparedWrite { values, point }))
}

// =============================================================================
// Execution
// =============================================================================

/// Inserts a prepared row and bumps the row counter.
pub fn execute_insert(
    conn: &Connection,
    table: &ManagedTable,
    write: &PreparedWrite,
    point: PointUpdate,
) -> Result<RowId> {
    let mut names: Vec<String> = write.values.iter().map(|(n, _)| quote_ident(n)).collect();
    let mut params: Vec<rusqlite::types::Value> = write.values.iter().map(|(_, v)| to_sql(v)).collect();
    if let Some(point) = point {
        names.push(quote_ident(GEOMETRY_COLUMN));
        params.push(point.map(|p| p.to_ewkt()).into());
    }

    let ident = quote_ident(&table.storage_ident());
    let sql = if names.is_empty() {
        format!("INSERT INTO {ident} DEFAULT VALUES")
    } else {
        let placeholders = vec!["?"; names.len()].join(", ");
        format!("INSERT INTO {ident} ({}) VALUES ({placeholders})", names.join(", "))
    };
    conn.execute(&sql, params_from_iter(params))?;
    let row_id = RowId::from_raw(conn.last_insert_rowid());

    catalog::add_rows_counted(conn, table.id, 1)?;
    debug!(table_id = table.id.as_raw(), row_id = row_id.as_raw(), "row inserted");
    Ok(row_id)
}

/// Applies a prepared update and refreshes `updated_at`.
///
/// # Errors
///
/// `Error::NotFound` when the row doesn't exist.
pub fn execute_update(
    conn: &Connection,
    table: &ManagedTable,
    row_id: RowId,
    write: &PreparedWrite,
    point: PointUpdate,
) -> Result<()> {
    let mut sets: Vec<String> = write
        .values
        .iter()
        .map(|(n, _)| format!("{} = ?", quote_ident(n)))
        .collect();
    let mut params: Vec<rusqlite::types::Value> = write.values.iter().map(|(_, v)| to_sql(v)).collect();
    if let Some(point) = point {
        sets.push(format!("{} = ?", quote_ident(GEOMETRY_COLUMN)));
        params.push(point.map(|p| p.to_ewkt()).into());
    }
    sets.push(format!("{} = CURRENT_TIMESTAMP", quote_ident(UPDATED_AT_COLUMN)));
    params.push(row_id.as_raw().into());

    let changed = conn.execute(
        &format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(&table.storage_ident()),
            sets.join(", "),
            quote_ident(ROW_ID_COLUMN)
        ),
        params_from_iter(params),
    )?;
    if changed == 0 {
        return Err(Error::NotFound(format!("{row_id} in {}", table.id)));
    }
    debug!(table_id = table.id.as_raw(), row_id = row_id.as_raw(), "row updated");
    Ok(())
}

// =============================================================================
// Bulk Inserts
// =============================================================================

/// Inserts rows one after another in the caller's transaction, widening
/// columns inline. Used by imports, which hold the table exclusively.
///
/// Address points are left empty; a bulk insert never geocodes.
pub struct BulkInserter<'a> {
    conn: &'a Connection,
    columns: Vec<ColumnDescriptor>,
}

impl<'a> BulkInserter<'a> {
    pub fn new(conn: &'a Connection, table: &ManagedTable) -> Result<Self> {
        Ok(Self { conn, columns: introspect::describe(conn, table)? })
    }

    pub fn insert(&mut self, table: &mut ManagedTable, attributes: &Attributes) -> Result<RowId> {
        for _ in 0..MAX_WIDEN_PASSES {
            match prepare_insert_with(&self.columns, table, attributes)? {
                Prepared::Widen(columns) => {
                    for column in &columns {
                        ddl::widen_column(self.conn, table, column)?;
                    }
                    self.columns = introspect::describe(self.conn, table)?;
                }
                Prepared::Ready(write) => {
                    let point = match &write.point {
                        PointSource::Keep => None,
                        PointSource::Direct(point) => Some(*point),
                        PointSource::Address(_) => Some(None),
                    };
                    return execute_insert(self.conn, table, &write, point);
                }
            }
        }
        Err(Error::Schema(format!("{} kept requiring widening", table.id)))
    }
}
