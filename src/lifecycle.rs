//! # Table Lifecycle Manager
//!
//! Creation, renaming and destruction of managed tables, plus the catalog
//! attributes that aren't structural (tags, privacy).
//!
//! ## Naming
//!
//! The storage name is the sanitized display name, made unique among the
//! owner's tables with a numeric suffix:
//!
//! ```text
//!   "Wadus"  →  wadus
//!   "Wadus"  →  wadus_2
//!   (none)   →  untitled_table, untitled_table_2, ...
//! ```
//!
//! A name is only free when no catalog row uses it *and* no backing table of
//! that name exists.

use rusqlite::Connection;
use tracing::info;

use crate::catalog;
use crate::ddl::{default_schema, detect_roles, parse_schema, sanitize_identifier};
use crate::error::Result;
use crate::storage::{self, StoredColumn};
use crate::types::{storage_ident, GeometryRoles, ManagedTable, OwnerId, Privacy, TableId};

/// Name given to tables created without one.
pub const UNTITLED_TABLE: &str = "untitled_table";

/// Parameters of a new table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTable {
    /// Desired display name; `None` or blank means untitled.
    pub name: Option<String>,
    /// Schema spec (`name type, ...`); `None` means the default schema.
    pub schema: Option<String>,
    /// Comma-separated tag list.
    pub tags: Option<String>,
    pub privacy: Privacy,
}

impl NewTable {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn with_privacy(mut self, privacy: Privacy) -> Self {
        self.privacy = privacy;
        self
    }

    fn display_name(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }
}

// =============================================================================
// Naming
// =============================================================================

fn base_name(display_name: Option<&str>) -> String {
    let base = display_name.map(sanitize_identifier).unwrap_or_default();
    if base.is_empty() {
        UNTITLED_TABLE.to_string()
    } else {
        base
    }
}

/// First free name derived from `base`. `current` is the name the table
/// already holds, if any (it stays usable on rename).
fn free_name(
    conn: &Connection,
    owner: OwnerId,
    base: &str,
    current: Option<(TableId, &str)>,
) -> Result<String> {
    let exclude = current.map(|(id, _)| id);
    let mut suffix = 1u32;
    loop {
        let candidate = if suffix == 1 { base.to_string() } else { format!("{base}_{suffix}") };
        if current.is_some_and(|(_, name)| name == candidate) {
            return Ok(candidate);
        }
        let taken = catalog::name_taken(conn, owner, &candidate, exclude)?
            || storage::table_exists(conn, &storage_ident(owner, &candidate))?;
        if !taken {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Creates a table: backing storage, catalog row, tags and the owner's
/// counter. Runs in the caller's transaction.
pub fn create_table(conn: &Connection, owner: OwnerId, new: &NewTable) -> Result<ManagedTable> {
    let (columns, roles) = match new.schema.as_deref().map(str::trim) {
        Some(spec) if !spec.is_empty() => {
            let columns = parse_schema(spec)?;
            let roles = detect_roles(&columns);
            (columns, roles)
        }
        _ => default_schema(),
    };
    create_with_columns(conn, owner, new, &columns, &roles)
}

/// Creates a table from already resolved columns.
pub(crate) fn create_with_columns(
    conn: &Connection,
    owner: OwnerId,
    new: &NewTable,
    columns: &[StoredColumn],
    roles: &GeometryRoles,
) -> Result<ManagedTable> {
    let name = free_name(conn, owner, &base_name(new.display_name()), None)?;
    let display_name = new.display_name().unwrap_or(&name).to_string();

    storage::create_table(conn, &storage_ident(owner, &name), columns)?;
    let id = catalog::insert_table(conn, owner, &name, &display_name, new.privacy, roles)?;
    if let Some(raw) = &new.tags {
        catalog::replace_tags(conn, owner, id, &catalog::parse_tags(raw))?;
    }
    catalog::refresh_owner_count(conn, owner)?;

    info!(
        table_id = id.as_raw(),
        owner_id = owner.as_raw(),
        name = %name,
        columns = columns.len(),
        "table created"
    );
    catalog::load_table(conn, id)
}

/// Renames a table and its backing storage. Data and roles are kept.
pub fn rename_table(conn: &Connection, table: &mut ManagedTable, display_name: &str) -> Result<()> {
    let display_name = display_name.trim();
    let name = free_name(
        conn,
        table.owner_id,
        &base_name(Some(display_name).filter(|n| !n.is_empty())),
        Some((table.id, table.name.as_str())),
    )?;

    if name != table.name {
        storage::rename_table(
            conn,
            &table.storage_ident(),
            &storage_ident(table.owner_id, &name),
        )?;
    }
    let display_name = if display_name.is_empty() { name.clone() } else { display_name.to_string() };
    catalog::rename_table(conn, table.id, &name, &display_name)?;

    info!(table_id = table.id.as_raw(), from = %table.name, to = %name, "table renamed");
    table.name = name;
    table.display_name = display_name;
    Ok(())
}

/// Drops the backing storage, the catalog row and its tags, and re-derives
/// the owner's counter.
pub fn destroy_table(conn: &Connection, table: &ManagedTable) -> Result<()> {
    storage::drop_table(conn, &table.storage_ident())?;
    catalog::delete_table(conn, table.id)?;
    catalog::refresh_owner_count(conn, table.owner_id)?;
    info!(table_id = table.id.as_raw(), owner_id = table.owner_id.as_raw(), "table destroyed");
    Ok(())
}

/// Replaces the table's tags with the comma-separated list `raw`.
pub fn set_tags(conn: &Connection, table: &mut ManagedTable, raw: &str) -> Result<()> {
    let tags = catalog::parse_tags(raw);
    catalog::replace_tags(conn, table.owner_id, table.id, &tags)?;
    catalog::touch(conn, table.id)?;
    table.tags = tags;
    Ok(())
}

pub fn set_privacy(conn: &Connection, table: &mut ManagedTable, privacy: Privacy) -> Result<()> {
    catalog::set_privacy(conn, table.id, privacy)?;
    table.privacy = privacy;
    Ok(())
}
