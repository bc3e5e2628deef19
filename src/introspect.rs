//! # Schema Introspector
//!
//! Reads the live column list of a backing table and presents it in a stable
//! order:
//!
//! ```text
//!   row_id │ user columns (live storage order) │ created_at │ updated_at
//! ```
//!
//! The hidden geometry column is never listed. Nothing here is cached; every
//! call asks SQLite, so a describe right after a DDL statement (even inside
//! the same transaction) sees the new structure.

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::storage;
use crate::types::{
    ColumnDescriptor, ManagedTable, CREATED_AT_COLUMN, GEOMETRY_COLUMN, ROW_ID_COLUMN,
    UPDATED_AT_COLUMN,
};

/// Describes every visible column of `table`, roles included.
///
/// # Errors
///
/// `Error::NotFound` when the backing table is gone.
pub fn describe(conn: &Connection, table: &ManagedTable) -> Result<Vec<ColumnDescriptor>> {
    let ident = table.storage_ident();
    let stored = storage::table_info(conn, &ident)?;
    if stored.is_empty() {
        return Err(Error::NotFound(format!("storage of {}", table.id)));
    }

    let mut head = Vec::with_capacity(1);
    let mut body = Vec::with_capacity(stored.len());
    let mut tail = Vec::with_capacity(2);

    for column in stored {
        let mut descriptor = ColumnDescriptor::new(column.name, column.ty);
        descriptor.role = table.roles.role_of(&descriptor.name);
        match descriptor.name.as_str() {
            ROW_ID_COLUMN => head.push(descriptor),
            GEOMETRY_COLUMN => {}
            CREATED_AT_COLUMN | UPDATED_AT_COLUMN => tail.push(descriptor),
            _ => body.push(descriptor),
        }
    }
    // created_at before updated_at, whatever the physical order.
    tail.sort_by_key(|d| d.name != CREATED_AT_COLUMN);

    head.extend(body);
    head.extend(tail);
    Ok(head)
}

/// Looks up one visible column by name.
pub fn find_column(
    conn: &Connection,
    table: &ManagedTable,
    name: &str,
) -> Result<Option<ColumnDescriptor>> {
    Ok(describe(conn, table)?.into_iter().find(|c| c.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::storage::StoredColumn;
    use crate::type_map::{InternalType, PublicType};
    use crate::types::{ColumnRole, GeometryRoles, OwnerId, Privacy, TableId, TypeFormat};

    fn table() -> ManagedTable {
        ManagedTable {
            id: TableId::from_raw(1),
            owner_id: OwnerId::from_raw(1),
            name: "places".into(),
            display_name: "places".into(),
            privacy: Privacy::Private,
            tags: Vec::new(),
            rows_counted: 0,
            roles: GeometryRoles {
                latitude: Some("lat".into()),
                longitude: Some("lon".into()),
                ..GeometryRoles::default()
            },
        }
    }

    /// Columns added after creation land physically after the timestamps,
    /// but are still presented before them.
    #[test]
    fn test_describe_orders_reserved_columns() {
        let conn = Database::open_in_memory().unwrap().into_connection();
        let table = table();
        storage::create_table(
            &conn,
            &table.storage_ident(),
            &[
                StoredColumn::new("lat", InternalType::DoublePrecision),
                StoredColumn::new("lon", InternalType::DoublePrecision),
            ],
        )
        .unwrap();
        storage::add_column(
            &conn,
            &table.storage_ident(),
            &StoredColumn::new("note", InternalType::Varchar(Some(40))),
        )
        .unwrap();

        let columns = describe(&conn, &table).unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["row_id", "lat", "lon", "note", "created_at", "updated_at"]);

        assert_eq!(columns[1].role, Some(ColumnRole::Latitude));
        assert_eq!(columns[3].type_name(TypeFormat::Internal), "character varying(40)");
        assert_eq!(columns[3].public_type(), PublicType::String);
        assert_eq!(columns[1].type_name(TypeFormat::Public), "number");
    }

    #[test]
    fn test_describe_missing_storage() {
        let conn = Database::open_in_memory().unwrap().into_connection();
        assert!(matches!(describe(&conn, &table()), Err(Error::NotFound(_))));
    }
}
