//! # Storage Engine Boundary
//!
//! Every statement that touches a backing table's *structure* goes through
//! this module. Callers hand in a `&Connection` (usually a `Transaction`,
//! which derefs to one), so each function composes into a larger atomic
//! operation instead of committing on its own.
//!
//! ## Backing Table Layout
//!
//! ```text
//! CREATE TABLE "u7_wadus" (
//!     "row_id"     INTEGER PRIMARY KEY AUTOINCREMENT,
//!     "name"       text,                         ┐
//!     "latitude"   double precision,             │ user columns
//!     ...                                        ┘
//!     "the_geom"   geometry
//!         CONSTRAINT enforce_srid_the_geom    CHECK (...)
//!         CONSTRAINT enforce_geotype_the_geom CHECK (...),
//!     "created_at" timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP,
//!     "updated_at" timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP
//! )
//! ```
//!
//! Columns added later are appended by `ALTER TABLE`, so the physical order
//! drifts; the introspector restores presentation order when reading.
//!
//! ## Retyping by Rebuild
//!
//! SQLite can't change a declared column type in place. A retype copies the
//! table into a shadow with the new declaration, casts the column row by row
//! in Rust, swaps the tables, and restores the autoincrement sequence so row
//! ids are never reused:
//!
//! ```text
//!  u7_t ──INSERT SELECT──► dyntable_rebuild_u7_t ──UPDATE per row (cast)──┐
//!   │                                                                     │
//!   └── DROP ◄──────────────── RENAME dyntable_rebuild_u7_t → u7_t ◄──────┘
//! ```
//!
//! Backing tables are always named `u<owner>_<name>`, so the shadow's prefix
//! keeps it out of every owner's namespace.

use rusqlite::{params, Connection, OptionalExtension};
use sqlparser::ast::{ColumnDef, CreateTable, Statement};
use sqlparser::dialect::{Dialect, SQLiteDialect};
use sqlparser::parser::Parser;
use tracing::debug;

use crate::codec::{cast_value, present, to_sql};
use crate::error::{Error, Result};
use crate::type_map::InternalType;
use crate::types::{
    ConstraintDescriptor, Value, CREATED_AT_COLUMN, GEOMETRY_COLUMN, ROW_ID_COLUMN,
    UPDATED_AT_COLUMN,
};

// =============================================================================
// Geometry Constraints
// =============================================================================

/// SRID stored in every geometry value.
pub const GEOMETRY_SRID: i64 = 3857;

const SRID_CONSTRAINT: &str = "enforce_srid_the_geom";
const GEOTYPE_CONSTRAINT: &str = "enforce_geotype_the_geom";

/// Prefix of the shadow table used while retyping.
const REBUILD_PREFIX: &str = "dyntable_rebuild_";

// =============================================================================
// Identifiers
// =============================================================================

/// Quotes an identifier for use in SQL.
///
/// Names reaching this point are already sanitized, but quoting keeps
/// keywords (`order`, `group`, ...) usable as column names.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A column as it physically exists in a backing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredColumn {
    pub name: String,
    pub ty: InternalType,
}

impl StoredColumn {
    pub fn new(name: impl Into<String>, ty: InternalType) -> Self {
        Self { name: name.into(), ty }
    }
}

fn execute_ddl(conn: &Connection, sql: &str) -> Result<()> {
    debug!(sql, "executing ddl");
    conn.execute_batch(sql)?;
    Ok(())
}

// =============================================================================
// Tables
// =============================================================================

/// Returns true when a table named `ident` exists.
pub fn table_exists(conn: &Connection, ident: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [ident],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn create_table_sql(ident: &str, columns: &[StoredColumn]) -> String {
    let mut defs = Vec::with_capacity(columns.len() + 4);
    defs.push(format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(ROW_ID_COLUMN)));
    for column in columns {
        defs.push(format!("{} {}", quote_ident(&column.name), column.ty.sql_name()));
    }
    defs.push(format!(
        "{geom} geometry \
         CONSTRAINT {SRID_CONSTRAINT} CHECK ({geom} IS NULL OR {geom} LIKE 'SRID={GEOMETRY_SRID};%') \
         CONSTRAINT {GEOTYPE_CONSTRAINT} CHECK ({geom} IS NULL OR instr({geom}, ';POINT(') > 0)",
        geom = quote_ident(GEOMETRY_COLUMN),
    ));
    for reserved in [CREATED_AT_COLUMN, UPDATED_AT_COLUMN] {
        defs.push(format!(
            "{} timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP",
            quote_ident(reserved)
        ));
    }
    format!("CREATE TABLE {} (\n    {}\n)", quote_ident(ident), defs.join(",\n    "))
}

/// Creates a backing table with the reserved columns around `columns`.
pub fn create_table(conn: &Connection, ident: &str, columns: &[StoredColumn]) -> Result<()> {
    execute_ddl(conn, &create_table_sql(ident, columns))
}

pub fn rename_table(conn: &Connection, from: &str, to: &str) -> Result<()> {
    execute_ddl(
        conn,
        &format!("ALTER TABLE {} RENAME TO {}", quote_ident(from), quote_ident(to)),
    )
}

/// Drops a backing table. Missing tables are not an error.
pub fn drop_table(conn: &Connection, ident: &str) -> Result<()> {
    execute_ddl(conn, &format!("DROP TABLE IF EXISTS {}", quote_ident(ident)))
}

/// Live row count.
pub fn count_rows(conn: &Connection, ident: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(ident)),
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

// =============================================================================
// Columns
// =============================================================================

/// Every physical column of `ident`, in storage order.
///
/// # Errors
///
/// `Error::Schema` when a declared type is outside the closed type set.
pub fn table_info(conn: &Connection, ident: &str) -> Result<Vec<StoredColumn>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(ident)))?;
    let raw = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(name, declared)| {
            let ty = InternalType::parse(&declared).ok_or_else(|| {
                Error::Schema(format!(
                    "column '{name}' of {ident} has unsupported type '{declared}'"
                ))
            })?;
            Ok(StoredColumn { name, ty })
        })
        .collect()
}

/// The user columns of `ident` (reserved and hidden ones excluded), in
/// storage order.
pub fn user_columns(conn: &Connection, ident: &str) -> Result<Vec<StoredColumn>> {
    Ok(table_info(conn, ident)?
        .into_iter()
        .filter(|c| !crate::types::is_reserved_column(&c.name))
        .collect())
}

pub fn add_column(conn: &Connection, ident: &str, column: &StoredColumn) -> Result<()> {
    execute_ddl(
        conn,
        &format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(ident),
            quote_ident(&column.name),
            column.ty.sql_name()
        ),
    )
}

pub fn rename_column(conn: &Connection, ident: &str, from: &str, to: &str) -> Result<()> {
    execute_ddl(
        conn,
        &format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quote_ident(ident),
            quote_ident(from),
            quote_ident(to)
        ),
    )
}

pub fn drop_column(conn: &Connection, ident: &str, name: &str) -> Result<()> {
    execute_ddl(
        conn,
        &format!("ALTER TABLE {} DROP COLUMN {}", quote_ident(ident), quote_ident(name)),
    )
}

/// Changes the declared type of `column`, casting every stored value.
///
/// Values the new type can't represent are replaced by `force_value` when
/// one is given; otherwise the first of them fails the whole operation with
/// `Error::Cast`. Must run inside a transaction: a failure leaves the shadow
/// table behind for the rollback to discard.
pub fn retype_column(
    conn: &Connection,
    ident: &str,
    column: &str,
    new_type: InternalType,
    force_value: Option<&Value>,
) -> Result<()> {
    let mut columns = user_columns(conn, ident)?;
    let old_type = columns
        .iter()
        .find(|c| c.name == column)
        .map(|c| c.ty)
        .ok_or_else(|| Error::ColumnNotFound(column.to_string()))?;

    // Cast up front so nothing is built when a value doesn't fit.
    let stored = read_column(conn, ident, column, old_type)?;
    let mut casted = Vec::with_capacity(stored.len());
    for (row_id, value) in stored {
        let converted = match cast_value(&value, new_type) {
            Some(v) => v,
            None => match force_value {
                Some(force) => cast_value(force, new_type).ok_or_else(|| Error::Cast {
                    column: column.to_string(),
                    value: force.to_text(),
                    target: new_type.sql_name(),
                })?,
                None => {
                    return Err(Error::Cast {
                        column: column.to_string(),
                        value: value.to_text(),
                        target: new_type.sql_name(),
                    })
                }
            },
        };
        casted.push((row_id, converted));
    }

    for c in columns.iter_mut().filter(|c| c.name == column) {
        c.ty = new_type;
    }

    let sequence = read_sequence(conn, ident)?;
    let shadow = format!("{REBUILD_PREFIX}{ident}");
    create_table(conn, &shadow, &columns)?;

    let mut names = vec![ROW_ID_COLUMN.to_string()];
    names.extend(columns.iter().map(|c| c.name.clone()));
    names.extend(
        [GEOMETRY_COLUMN, CREATED_AT_COLUMN, UPDATED_AT_COLUMN]
            .iter()
            .map(|s| s.to_string()),
    );
    let list = names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", ");
    execute_ddl(
        conn,
        &format!(
            "INSERT INTO {} ({list}) SELECT {list} FROM {}",
            quote_ident(&shadow),
            quote_ident(ident)
        ),
    )?;

    {
        let mut update = conn.prepare(&format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote_ident(&shadow),
            quote_ident(column),
            quote_ident(ROW_ID_COLUMN)
        ))?;
        for (row_id, value) in &casted {
            update.execute(params![to_sql(value), row_id])?;
        }
    }

    drop_table(conn, ident)?;
    rename_table(conn, &shadow, ident)?;
    if let Some(seq) = sequence {
        restore_sequence(conn, ident, seq)?;
    }
    Ok(())
}

fn read_column(
    conn: &Connection,
    ident: &str,
    column: &str,
    ty: InternalType,
) -> Result<Vec<(i64, Value)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {}, {} FROM {} ORDER BY {}",
        quote_ident(ROW_ID_COLUMN),
        quote_ident(column),
        quote_ident(ident),
        quote_ident(ROW_ID_COLUMN)
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, present(row.get(1)?, ty)))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn read_sequence(conn: &Connection, ident: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = ?",
            [ident],
            |row| row.get(0),
        )
        .optional()?)
}

fn restore_sequence(conn: &Connection, ident: &str, seq: i64) -> Result<()> {
    conn.execute("DELETE FROM sqlite_sequence WHERE name = ?", [ident])?;
    conn.execute(
        "INSERT INTO sqlite_sequence (name, seq) VALUES (?, ?)",
        params![ident, seq],
    )?;
    Ok(())
}

// =============================================================================
// Constraints
// =============================================================================

/// Parses one `CREATE TABLE` statement and returns its column definitions.
pub(crate) fn parse_column_defs(
    sql: &str,
    dialect: &dyn Dialect,
) -> std::result::Result<Vec<ColumnDef>, String> {
    let mut statements = Parser::parse_sql(dialect, sql).map_err(|e| e.to_string())?;
    if statements.len() != 1 {
        return Err("expected exactly one statement".to_string());
    }
    match statements.remove(0) {
        Statement::CreateTable(CreateTable { columns, .. }) => Ok(columns),
        _ => Err("expected a CREATE TABLE statement".to_string()),
    }
}

/// Named column constraints declared on `ident`, read from the stored
/// `CREATE TABLE` statement. A missing table has none.
pub fn list_constraints(conn: &Connection, ident: &str) -> Result<Vec<ConstraintDescriptor>> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?",
            [ident],
            |row| row.get(0),
        )
        .optional()?;
    let Some(sql) = sql else { return Ok(Vec::new()) };

    let columns = parse_column_defs(&sql, &SQLiteDialect {})
        .map_err(|e| Error::Schema(format!("unreadable definition of {ident}: {e}")))?;
    Ok(columns
        .into_iter()
        .flat_map(|column| {
            let column_name = column.name.value;
            column.options.into_iter().filter_map(move |option| {
                option.name.map(|name| ConstraintDescriptor {
                    name: name.value,
                    column: column_name.clone(),
                })
            })
        })
        .collect())
}

// =============================================================================
// Tests
// =============================================================================
