//! # DDL Executor
//!
//! Structural changes to a managed table's columns. Every function here runs
//! against the caller's transaction and leaves the catalog (roles, counters)
//! consistent with the backing table when it returns `Ok`; an `Err` is meant
//! to be followed by a rollback.
//!
//! ## Column Names
//!
//! User-supplied names go through [`sanitize_identifier`] before they reach
//! the engine:
//!
//! ```text
//!   "Wadus 2"      →  wadus_2
//!   "  Año--de "   →  a_o_de
//!   "¿?"           →  (empty: rejected or replaced by the caller)
//! ```
//!
//! ## Schema Specs
//!
//! Tables can be created from a textual column list:
//!
//! ```text
//!   name varchar(40) NOT NULL, "Weird Name" text, age integer PRIMARY KEY
//! ```
//!
//! The list is parsed with `sqlparser` as the body of a `CREATE TABLE`.
//! Column options are accepted and ignored; each type is resolved through
//! the Type Mapper, so only known types ever reach the engine.

use rusqlite::Connection;
use sqlparser::dialect::PostgreSqlDialect;
use tracing::info;

use crate::codec::parse_literal;
use crate::error::{Error, Result};
use crate::geometry::{self, ColumnEvent};
use crate::introspect;
use crate::storage::{self, StoredColumn};
use crate::type_map::{resolve_requested_type, InternalType};
use crate::types::{
    is_reserved_column, ColumnDescriptor, ConstraintDescriptor, GeometryRoles, ManagedTable,
};

// =============================================================================
// Identifiers
// =============================================================================

/// Lowercases `raw`, collapses every run of characters outside `[a-z0-9_]`
/// into one `_`, and trims leading/trailing underscores. May return an empty
/// string.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Sanitizes a column name, failing when nothing usable is left.
fn column_name(raw: &str) -> Result<String> {
    let name = sanitize_identifier(raw);
    if name.is_empty() {
        return Err(Error::InvalidAttributes(vec![raw.to_string()]));
    }
    Ok(name)
}

/// Returns `name`, or `name_2`, `name_3`, ... when taken.
pub fn dedupe_name(name: &str, taken: &[String]) -> String {
    if !taken.iter().any(|t| t == name) {
        return name.to_string();
    }
    (2..)
        .map(|n| format!("{name}_{n}"))
        .find(|candidate| !taken.iter().any(|t| t == candidate))
        .unwrap_or_else(|| name.to_string())
}

// =============================================================================
// Schema Specs
// =============================================================================

/// The default user columns of a table created without a schema.
pub fn default_schema() -> (Vec<StoredColumn>, GeometryRoles) {
    let columns = vec![
        StoredColumn::new("name", InternalType::Text),
        StoredColumn::new("latitude", InternalType::DoublePrecision),
        StoredColumn::new("longitude", InternalType::DoublePrecision),
        StoredColumn::new("description", InternalType::Text),
    ];
    let roles = GeometryRoles {
        latitude: Some("latitude".into()),
        longitude: Some("longitude".into()),
        ..GeometryRoles::default()
    };
    (columns, roles)
}

/// Assigns the lat/lon role when numeric columns named exactly `latitude`
/// and `longitude` exist.
pub fn detect_roles(columns: &[StoredColumn]) -> GeometryRoles {
    let numeric = |name: &str| columns.iter().any(|c| c.name == name && c.ty.is_numeric());
    if numeric("latitude") && numeric("longitude") {
        GeometryRoles {
            latitude: Some("latitude".into()),
            longitude: Some("longitude".into()),
            ..GeometryRoles::default()
        }
    } else {
        GeometryRoles::default()
    }
}

/// Parses a schema spec into user columns.
///
/// The spec is read as the body of a `CREATE TABLE` statement; column
/// options (`NOT NULL`, `DEFAULT 'a,b'`, `CONSTRAINT x PRIMARY KEY`, ...)
/// and table constraints are ignored. Reserved names are skipped (those
/// columns always exist); duplicate names after sanitizing get numeric
/// suffixes.
///
/// # Errors
///
/// - `Error::InvalidType` for an unknown or missing type, or a spec that
///   doesn't parse as a column list
/// - `Error::InvalidAttributes` for a name that sanitizes to nothing
pub fn parse_schema(spec: &str) -> Result<Vec<StoredColumn>> {
    let defs = storage::parse_column_defs(
        &format!("CREATE TABLE schema_spec ({spec})"),
        &PostgreSqlDialect {},
    )
    .map_err(|e| Error::InvalidType(format!("{}: {e}", spec.trim())))?;

    let mut columns: Vec<StoredColumn> = Vec::new();
    for def in defs {
        let name = column_name(&def.name.value)?;
        if is_reserved_column(&name) {
            continue;
        }
        let ty = resolve_requested_type(&def.data_type.to_string())?;
        let taken: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        columns.push(StoredColumn::new(dedupe_name(&name, &taken), ty));
    }
    Ok(columns)
}

// =============================================================================
// Column Operations
// =============================================================================

/// Requested changes for [`modify_column`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnChange {
    pub new_name: Option<String>,
    pub new_type: Option<String>,
    /// Literal replacing values that can't be cast to `new_type`.
    pub force_value: Option<String>,
}

impl ColumnChange {
    pub fn rename(name: impl Into<String>) -> Self {
        Self { new_name: Some(name.into()), ..Self::default() }
    }

    pub fn retype(ty: impl Into<String>) -> Self {
        Self { new_type: Some(ty.into()), ..Self::default() }
    }

    pub fn with_force_value(mut self, literal: impl Into<String>) -> Self {
        self.force_value = Some(literal.into());
        self
    }
}

fn require_user_column(
    conn: &Connection,
    table: &ManagedTable,
    name: &str,
) -> Result<ColumnDescriptor> {
    if is_reserved_column(name) {
        return Err(Error::ProtectedColumn(name.to_string()));
    }
    introspect::find_column(conn, table, name)?
        .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
}

/// Adds a column of a public or internal type.
pub fn add_column(
    conn: &Connection,
    table: &ManagedTable,
    name: &str,
    type_name: &str,
) -> Result<ColumnDescriptor> {
    let ty = resolve_requested_type(type_name)?;
    let name = column_name(name)?;
    if is_reserved_column(&name) {
        return Err(Error::ProtectedColumn(name));
    }
    if introspect::find_column(conn, table, &name)?.is_some() {
        return Err(Error::ColumnExists(name));
    }

    storage::add_column(conn, &table.storage_ident(), &StoredColumn::new(name.clone(), ty))?;
    info!(table_id = table.id.as_raw(), column = %name, ty = %ty, "column added");

    introspect::find_column(conn, table, &name)?
        .ok_or_else(|| Error::Schema(format!("column '{name}' missing after add")))
}

/// Renames and/or retypes a column, then updates geometry roles.
///
/// `table` is updated in place with the new roles.
pub fn modify_column(
    conn: &Connection,
    table: &mut ManagedTable,
    selector: &str,
    change: &ColumnChange,
) -> Result<ColumnDescriptor> {
    let current = require_user_column(conn, table, selector)?;
    let ident = table.storage_ident();
    let mut events = Vec::new();
    let mut name = current.name.clone();

    if let Some(raw) = &change.new_name {
        let new_name = column_name(raw)?;
        if is_reserved_column(&new_name) {
            return Err(Error::ProtectedColumn(new_name));
        }
        if new_name != name {
            if introspect::find_column(conn, table, &new_name)?.is_some() {
                return Err(Error::ColumnExists(new_name));
            }
            storage::rename_column(conn, &ident, &name, &new_name)?;
            events.push(ColumnEvent::Renamed { from: name.clone(), to: new_name.clone() });
            name = new_name;
        }
    }

    if let Some(type_name) = &change.new_type {
        let new_type = resolve_requested_type(type_name)?;
        let force = change.force_value.as_deref().map(parse_literal).transpose()?;
        if new_type != current.internal_type {
            storage::retype_column(conn, &ident, &name, new_type, force.as_ref())?;
            events.push(ColumnEvent::Retyped { column: name.clone(), to: new_type.to_public() });
        }
    }

    geometry::apply_column_events(conn, table, &events)?;
    info!(
        table_id = table.id.as_raw(),
        column = %selector,
        new_name = %name,
        "column modified"
    );

    introspect::find_column(conn, table, &name)?
        .ok_or_else(|| Error::Schema(format!("column '{name}' missing after modify")))
}

/// Drops a column, then updates geometry roles.
pub fn drop_column(conn: &Connection, table: &mut ManagedTable, name: &str) -> Result<()> {
    let column = require_user_column(conn, table, name)?;
    storage::drop_column(conn, &table.storage_ident(), &column.name)?;
    geometry::apply_column_events(
        conn,
        table,
        &[ColumnEvent::Dropped { column: column.name.clone() }],
    )?;
    info!(table_id = table.id.as_raw(), column = %column.name, "column dropped");
    Ok(())
}

/// Widens an integer column to `double precision`. No-op for any other type.
///
/// Returns true when the column was widened.
pub fn widen_column(conn: &Connection, table: &mut ManagedTable, name: &str) -> Result<bool> {
    let column = require_user_column(conn, table, name)?;
    if !column.internal_type.is_integer() {
        return Ok(false);
    }
    storage::retype_column(
        conn,
        &table.storage_ident(),
        &column.name,
        InternalType::DoublePrecision,
        None,
    )?;
    geometry::apply_column_events(
        conn,
        table,
        &[ColumnEvent::Retyped {
            column: column.name.clone(),
            to: InternalType::DoublePrecision.to_public(),
        }],
    )?;
    info!(
        table_id = table.id.as_raw(),
        column = %column.name,
        from = %column.internal_type,
        "column widened to double precision"
    );
    Ok(true)
}

/// Named constraints of the backing table; none when storage is gone.
pub fn list_constraints(conn: &Connection, table: &ManagedTable) -> Result<Vec<ConstraintDescriptor>> {
    storage::list_constraints(conn, &table.storage_ident())
}
