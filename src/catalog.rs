//! Catalog access: the `owners`, `managed_tables` and `tags` rows that
//! describe managed tables.
//!
//! Functions take a `&Connection` so they can run inside the caller's
//! transaction. None of them touch backing tables.

use rusqlite::{params, Connection, OptionalExtension, Row as SqlRow};

use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::types::{GeometryRoles, ManagedTable, OwnerId, Privacy, TableId};

const SELECT_TABLE: &str = "SELECT table_id, owner_id, name, display_name, privacy, rows_counted,
        lat_column, lon_column, address_column, address_sources
 FROM managed_tables";

// =============================================================================
// Owners
// =============================================================================

fn ensure_owner(conn: &Connection, owner: OwnerId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO owners (owner_id, tables_count) VALUES (?, 0)",
        [owner.as_raw()],
    )?;
    Ok(())
}

/// Re-derives the owner's table counter from the catalog.
pub fn refresh_owner_count(conn: &Connection, owner: OwnerId) -> Result<()> {
    ensure_owner(conn, owner)?;
    conn.execute(
        "UPDATE owners SET tables_count =
             (SELECT COUNT(*) FROM managed_tables WHERE owner_id = ?1)
         WHERE owner_id = ?1",
        [owner.as_raw()],
    )?;
    Ok(())
}

/// The owner's table counter; zero for owners that never created a table.
pub fn owner_table_count(conn: &Connection, owner: OwnerId) -> Result<u64> {
    let count: Option<i64> = conn
        .query_row(
            "SELECT tables_count FROM owners WHERE owner_id = ?",
            [owner.as_raw()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0) as u64)
}

// =============================================================================
// Managed Tables
// =============================================================================

/// Whether another of `owner`'s tables already uses the storage name
/// `name`. `exclude` is a table allowed to keep its current name (used on
/// rename).
pub fn name_taken(
    conn: &Connection,
    owner: OwnerId,
    name: &str,
    exclude: Option<TableId>,
) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT table_id FROM managed_tables WHERE owner_id = ? AND name = ?",
            params![owner.as_raw(), name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match (found, exclude) {
        (Some(id), Some(own)) => id != own.as_raw(),
        (Some(_), None) => true,
        (None, _) => false,
    })
}

/// Inserts the catalog row of a new table.
pub fn insert_table(
    conn: &Connection,
    owner: OwnerId,
    name: &str,
    display_name: &str,
    privacy: Privacy,
    roles: &GeometryRoles,
) -> Result<TableId> {
    ensure_owner(conn, owner)?;
    let now = current_time_ms() as i64;
    conn.execute(
        "INSERT INTO managed_tables
             (owner_id, name, display_name, privacy, rows_counted,
              lat_column, lon_column, address_column, address_sources,
              created_ms, updated_ms)
         VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)",
        params![
            owner.as_raw(),
            name,
            display_name,
            privacy.as_raw(),
            roles.latitude,
            roles.longitude,
            roles.address,
            join_sources(&roles.address_sources),
            now,
            now,
        ],
    )?;
    Ok(TableId::from_raw(conn.last_insert_rowid()))
}

fn join_sources(sources: &[String]) -> Option<String> {
    if sources.is_empty() {
        None
    } else {
        Some(sources.join(","))
    }
}

fn table_from_row(row: &SqlRow<'_>) -> rusqlite::Result<ManagedTable> {
    let sources: Option<String> = row.get(9)?;
    Ok(ManagedTable {
        id: TableId::from_raw(row.get(0)?),
        owner_id: OwnerId::from_raw(row.get(1)?),
        name: row.get(2)?,
        display_name: row.get(3)?,
        privacy: Privacy::from_raw(row.get(4)?),
        tags: Vec::new(),
        rows_counted: row.get::<_, i64>(5)? as u64,
        roles: GeometryRoles {
            latitude: row.get(6)?,
            longitude: row.get(7)?,
            address: row.get(8)?,
            address_sources: sources
                .map(|s| s.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
        },
    })
}

/// Loads a table snapshot, tags included.
///
/// # Errors
///
/// `Error::NotFound` for an unknown id.
pub fn load_table(conn: &Connection, id: TableId) -> Result<ManagedTable> {
    let mut table = conn
        .query_row(
            &format!("{SELECT_TABLE} WHERE table_id = ?"),
            [id.as_raw()],
            table_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;
    table.tags = load_tags(conn, id)?;
    Ok(table)
}

/// Every table of an owner, oldest first.
pub fn list_tables(conn: &Connection, owner: OwnerId) -> Result<Vec<ManagedTable>> {
    let mut tables = {
        let mut stmt =
            conn.prepare(&format!("{SELECT_TABLE} WHERE owner_id = ? ORDER BY table_id"))?;
        let rows = stmt
            .query_map([owner.as_raw()], table_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    for table in &mut tables {
        table.tags = load_tags(conn, table.id)?;
    }
    Ok(tables)
}

pub fn rename_table(conn: &Connection, id: TableId, name: &str, display_name: &str) -> Result<()> {
    conn.execute(
        "UPDATE managed_tables SET name = ?, display_name = ?, updated_ms = ? WHERE table_id = ?",
        params![name, display_name, current_time_ms() as i64, id.as_raw()],
    )?;
    Ok(())
}

pub fn update_roles(conn: &Connection, id: TableId, roles: &GeometryRoles) -> Result<()> {
    conn.execute(
        "UPDATE managed_tables
         SET lat_column = ?, lon_column = ?, address_column = ?, address_sources = ?,
             updated_ms = ?
         WHERE table_id = ?",
        params![
            roles.latitude,
            roles.longitude,
            roles.address,
            join_sources(&roles.address_sources),
            current_time_ms() as i64,
            id.as_raw(),
        ],
    )?;
    Ok(())
}

pub fn set_privacy(conn: &Connection, id: TableId, privacy: Privacy) -> Result<()> {
    conn.execute(
        "UPDATE managed_tables SET privacy = ?, updated_ms = ? WHERE table_id = ?",
        params![privacy.as_raw(), current_time_ms() as i64, id.as_raw()],
    )?;
    Ok(())
}

/// Adds `delta` rows to the denormalized counter.
pub fn add_rows_counted(conn: &Connection, id: TableId, delta: u64) -> Result<()> {
    conn.execute(
        "UPDATE managed_tables SET rows_counted = rows_counted + ?, updated_ms = ?
         WHERE table_id = ?",
        params![delta as i64, current_time_ms() as i64, id.as_raw()],
    )?;
    Ok(())
}

/// Marks the table as changed.
pub fn touch(conn: &Connection, id: TableId) -> Result<()> {
    conn.execute(
        "UPDATE managed_tables SET updated_ms = ? WHERE table_id = ?",
        params![current_time_ms() as i64, id.as_raw()],
    )?;
    Ok(())
}

/// Deletes the catalog row and the table's tags.
pub fn delete_table(conn: &Connection, id: TableId) -> Result<()> {
    conn.execute("DELETE FROM tags WHERE table_id = ?", [id.as_raw()])?;
    conn.execute("DELETE FROM managed_tables WHERE table_id = ?", [id.as_raw()])?;
    Ok(())
}

// =============================================================================
// Tags
// =============================================================================

/// Splits a comma-separated tag list, trimming entries and dropping empty
/// and repeated ones. Order of first appearance is kept.
pub fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

pub fn load_tags(conn: &Connection, id: TableId) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM tags WHERE table_id = ? ORDER BY tag_id")?;
    let tags = stmt
        .query_map([id.as_raw()], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(tags)
}

/// Replaces the table's tags. Tags left unreferenced are deleted with it.
pub fn replace_tags(conn: &Connection, owner: OwnerId, id: TableId, tags: &[String]) -> Result<()> {
    conn.execute("DELETE FROM tags WHERE table_id = ?", [id.as_raw()])?;
    let mut insert =
        conn.prepare("INSERT OR IGNORE INTO tags (name, owner_id, table_id) VALUES (?, ?, ?)")?;
    for tag in tags {
        insert.execute(params![tag, owner.as_raw(), id.as_raw()])?;
    }
    Ok(())
}

/// Number of tag rows referencing `id`.
pub fn count_tags(conn: &Connection, id: TableId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tags WHERE table_id = ?",
        [id.as_raw()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn conn() -> Connection {
        Database::open_in_memory().unwrap().into_connection()
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(parse_tags("tag1, tag 2, tag 3, tag 3"), vec!["tag1", "tag 2", "tag 3"]);
        assert!(parse_tags(" , ,").is_empty());
    }

    #[test]
    fn test_name_taken() {
        let conn = conn();
        let owner = OwnerId::from_raw(1);
        let roles = GeometryRoles::default();

        assert!(!name_taken(&conn, owner, "wadus", None).unwrap());
        let first = insert_table(&conn, owner, "wadus", "wadus", Privacy::Private, &roles).unwrap();
        assert!(name_taken(&conn, owner, "wadus", None).unwrap());

        // A table may keep its own name.
        assert!(!name_taken(&conn, owner, "wadus", Some(first)).unwrap());
        // Names are scoped per owner.
        assert!(!name_taken(&conn, OwnerId::from_raw(2), "wadus", None).unwrap());
    }

    #[test]
    fn test_roles_round_trip_through_catalog() {
        let conn = conn();
        let roles = GeometryRoles {
            latitude: None,
            longitude: None,
            address: Some("aggregated_address".into()),
            address_sources: vec!["street".into(), "city".into()],
        };
        let id = insert_table(&conn, OwnerId::from_raw(1), "t", "t", Privacy::Public, &roles)
            .unwrap();

        let table = load_table(&conn, id).unwrap();
        assert_eq!(table.roles, roles);
        assert_eq!(table.privacy, Privacy::Public);
        assert!(matches!(
            load_table(&conn, TableId::from_raw(99)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_owner_count_and_tags() {
        let conn = conn();
        let owner = OwnerId::from_raw(1);
        let id = insert_table(&conn, owner, "t", "t", Privacy::Private, &GeometryRoles::default())
            .unwrap();
        refresh_owner_count(&conn, owner).unwrap();
        assert_eq!(owner_table_count(&conn, owner).unwrap(), 1);

        replace_tags(&conn, owner, id, &parse_tags("a, b")).unwrap();
        replace_tags(&conn, owner, id, &parse_tags("b, c")).unwrap();
        assert_eq!(load_tags(&conn, id).unwrap(), vec!["b", "c"]);

        delete_table(&conn, id).unwrap();
        refresh_owner_count(&conn, owner).unwrap();
        assert_eq!(owner_table_count(&conn, owner).unwrap(), 0);
        assert_eq!(count_tags(&conn, id).unwrap(), 0);
    }
}
