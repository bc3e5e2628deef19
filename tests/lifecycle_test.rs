//! Table lifecycle tests
//!
//! Tests for:
//! - Storage name suffixing on collisions
//! - Reserved columns on new tables
//! - Rename keeping data and roles
//! - Destroy cascading to storage, constraints, tags and counters
//! - Persistence across reopen

mod common;

use common::OWNER;
use dyntable::{Error, NewTable, OwnerId, Page, Privacy, Value};

/// Tables with the same desired name get `_2`, `_3` suffixes.
#[test]
fn colliding_names_get_suffixes() {
    let engine = common::engine();
    let names: Vec<String> = (0..3)
        .map(|_| engine.create_table(OWNER, &NewTable::named("Wadus")).unwrap().name)
        .collect();
    assert_eq!(names, vec!["wadus", "wadus_2", "wadus_3"]);

    // Another owner has its own namespace.
    let other = engine.create_table(OwnerId::from_raw(2), &NewTable::named("Wadus")).unwrap();
    assert_eq!(other.name, "wadus");

    assert_eq!(engine.owner_table_count(OWNER).unwrap(), 3);
    assert_eq!(engine.owner_table_count(OwnerId::from_raw(2)).unwrap(), 1);
}

/// Unnamed tables are `untitled_table`, `untitled_table_2`, ...
#[test]
fn unnamed_tables_are_untitled() {
    let engine = common::engine();
    let first = engine.create_table(OWNER, &NewTable::default()).unwrap();
    let second = engine.create_table(OWNER, &NewTable::named("  ")).unwrap();
    assert_eq!(first.name, "untitled_table");
    assert_eq!(second.name, "untitled_table_2");
    assert_eq!(first.privacy, Privacy::Private);
}

/// A schema with constraints and quoted names is sanitized, and reserved
/// columns wrap the user columns.
#[test]
fn create_from_schema_spec() {
    let engine = common::engine();
    let table = engine
        .create_table(
            OWNER,
            &NewTable::named("films").with_schema(
                "\"code wadus\" char(5) CONSTRAINT firstkey PRIMARY KEY, title varchar(40) NOT NULL, \
                 did integer NOT NULL, date_prod date, kind varchar(10)",
            ),
        )
        .unwrap();

    let schema: Vec<(String, String)> = engine
        .describe(table.id)
        .unwrap()
        .into_iter()
        .map(|c| (c.name.clone(), c.type_name(dyntable::TypeFormat::Internal)))
        .collect();
    let expected = [
        ("row_id", "integer"),
        ("code_wadus", "character(5)"),
        ("title", "character varying(40)"),
        ("did", "integer"),
        ("date_prod", "date"),
        ("kind", "character varying(10)"),
        ("created_at", "timestamp"),
        ("updated_at", "timestamp"),
    ];
    let expected: Vec<(String, String)> =
        expected.iter().map(|(n, t)| (n.to_string(), t.to_string())).collect();
    assert_eq!(schema, expected);
    assert!(!table.roles.any());
}

/// Commas inside literals and type arguments don't split definitions.
#[test]
fn schema_spec_with_literal_defaults() {
    let engine = common::engine();
    let table = engine
        .create_table(
            OWNER,
            &NewTable::named("kinds")
                .with_schema("kind varchar(10) DEFAULT 'a,b', amount numeric(10, 2), n integer"),
        )
        .unwrap();
    let names: Vec<String> = engine
        .describe(table.id)
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["row_id", "kind", "amount", "n", "created_at", "updated_at"]);
}

/// An unknown type in a schema spec fails and creates nothing.
#[test]
fn invalid_schema_creates_nothing() {
    let engine = common::engine();
    let err = engine
        .create_table(OWNER, &NewTable::named("bad").with_schema("name wadus"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidType(_)));
    assert_eq!(engine.owner_table_count(OWNER).unwrap(), 0);
    assert!(engine.list_tables(OWNER).unwrap().is_empty());
}

/// Renaming moves storage but keeps rows and roles.
#[test]
fn rename_keeps_rows_and_roles() {
    let engine = common::engine();
    let table = engine.create_table(OWNER, &NewTable::named("before")).unwrap();
    engine
        .insert_row(table.id, &common::attrs(&[("name", Value::from("kept"))]))
        .unwrap();

    let renamed = engine.rename_table(table.id, "After Rename").unwrap();
    assert_eq!(renamed.name, "after_rename");
    assert_eq!(renamed.display_name, "After Rename");
    assert_eq!(renamed.roles, table.roles);

    let page = engine.list_rows(table.id, Page::first()).unwrap();
    assert_eq!(page.total_rows, 1);
    assert_eq!(page.rows[0].get("name"), Some(&Value::from("kept")));
}

/// Destroying drops storage (constraints included), tags and the counter.
#[test]
fn destroy_cascades() {
    let engine = common::engine();
    let table = engine
        .create_table(OWNER, &NewTable::named("doomed").with_tags("a, b"))
        .unwrap();
    let constraints: Vec<String> = engine
        .list_constraints(&table)
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(constraints, vec!["enforce_srid_the_geom", "enforce_geotype_the_geom"]);
    assert_eq!(engine.owner_table_count(OWNER).unwrap(), 1);

    engine.destroy_table(table.id).unwrap();

    assert!(engine.list_constraints(&table).unwrap().is_empty());
    assert_eq!(engine.owner_table_count(OWNER).unwrap(), 0);
    assert!(matches!(engine.table(table.id), Err(Error::NotFound(_))));
    assert!(matches!(engine.describe(table.id), Err(Error::NotFound(_))));

    // The name is free again.
    let again = engine.create_table(OWNER, &NewTable::named("doomed")).unwrap();
    assert_eq!(again.name, "doomed");
    assert!(again.tags.is_empty());
}

#[test]
fn tags_are_trimmed_and_deduplicated() {
    let engine = common::engine();
    let table = engine.create_table(OWNER, &NewTable::named("t")).unwrap();
    let table = engine.set_tags(table.id, "tag 1, , tag 2,tag 3,tag 3").unwrap();
    assert_eq!(table.tags, vec!["tag 1", "tag 2", "tag 3"]);
    assert_eq!(engine.table(table.id).unwrap().tags, table.tags);

    let table = engine.set_privacy(table.id, Privacy::Public).unwrap();
    assert_eq!(engine.table(table.id).unwrap().privacy, Privacy::Public);
}

/// Tables, rows and roles survive closing and reopening the file.
#[test]
fn reopen_keeps_tables() {
    let (_dir, path, engine) = common::create_temp_engine("reopen.db");
    let table = engine.create_table(OWNER, &NewTable::named("durable")).unwrap();
    engine
        .insert_row(
            table.id,
            &common::attrs(&[("latitude", Value::Float(1.5)), ("longitude", Value::Float(2.5))]),
        )
        .unwrap();
    drop(engine);

    let engine = common::open_file_engine(&path);
    let reopened = engine.table(table.id).unwrap();
    assert_eq!(reopened.name, "durable");
    assert_eq!(reopened.rows_counted, 1);
    assert_eq!(reopened.roles.lat_lon(), Some(("latitude", "longitude")));
    assert_eq!(engine.list_rows(table.id, Page::first()).unwrap().total_rows, 1);
}
