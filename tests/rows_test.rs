//! Row access tests
//!
//! Tests for:
//! - Attribute validation (unknown, reserved keys) leaving nothing written
//! - Empty inserts
//! - Pagination and live counts
//! - Automatic integer widening, fractions and out-of-range numbers
//! - Points from lat/lon and geocoded addresses
//! - Concurrent writers

mod common;

use std::sync::Arc;
use std::thread;

use common::{StubGeocoder, OWNER};
use dyntable::{
    Engine, Error, GeometryInput, ManagedTable, NewTable, Page, PublicType, RowId, TypeFormat,
    Value,
};

fn people(engine: &Engine) -> ManagedTable {
    engine
        .create_table(
            OWNER,
            &NewTable::named("people").with_schema("name text, age integer, city text"),
        )
        .unwrap()
}

/// An unknown key rejects the whole insert; nothing is written.
#[test]
fn unknown_attributes_write_nothing() {
    let engine = common::engine();
    let table = people(&engine);

    let err = engine
        .insert_row(
            table.id,
            &common::attrs(&[("name", Value::from("Javi")), ("non_existing", Value::from("x"))]),
        )
        .unwrap_err();
    match err {
        Error::InvalidAttributes(keys) => assert_eq!(keys, vec!["non_existing"]),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(engine.list_rows(table.id, Page::first()).unwrap().total_rows, 0);
    assert_eq!(engine.table(table.id).unwrap().rows_counted, 0);

    for reserved in ["row_id", "created_at", "updated_at", "the_geom"] {
        assert!(matches!(
            engine.insert_row(table.id, &common::attrs(&[(reserved, Value::Integer(1))])),
            Err(Error::InvalidAttributes(_))
        ));
    }
}

/// An empty attribute map inserts a row of defaults.
#[test]
fn empty_insert_succeeds() {
    let engine = common::engine();
    let table = people(&engine);
    let id = engine.insert_row(table.id, &common::attrs(&[])).unwrap();
    assert_eq!(id, RowId::from_raw(1));

    let row = engine.get_row(table.id, id).unwrap();
    assert_eq!(row.get("name"), Some(&Value::Null));
    assert!(matches!(row.get("created_at"), Some(Value::Text(_))));
    assert_eq!(engine.table(table.id).unwrap().rows_counted, 1);
}

#[test]
fn update_validation() {
    let engine = common::engine();
    let table = people(&engine);
    let id = engine
        .insert_row(table.id, &common::attrs(&[("name", Value::from("Ana"))]))
        .unwrap();

    assert!(matches!(
        engine.update_row(
            table.id,
            id,
            &common::attrs(&[("name", Value::from("Eva")), ("wadus", Value::Integer(1))])
        ),
        Err(Error::InvalidAttributes(_))
    ));
    assert_eq!(engine.get_row(table.id, id).unwrap().get("name"), Some(&Value::from("Ana")));

    assert!(matches!(
        engine.update_row(table.id, RowId::from_raw(99), &common::attrs(&[("name", Value::from("x"))])),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(engine.get_row(table.id, RowId::from_raw(99)), Err(Error::NotFound(_))));

    assert!(matches!(
        engine.update_row(table.id, id, &common::attrs(&[("age", Value::from("old"))])),
        Err(Error::Cast { .. })
    ));

    engine
        .update_row(table.id, id, &common::attrs(&[("age", Value::from("33")), ("city", Value::from(""))]))
        .unwrap();
    let row = engine.get_row(table.id, id).unwrap();
    assert_eq!(row.get("age"), Some(&Value::Integer(33)));
    assert_eq!(row.get("city"), Some(&Value::from("")));
}

/// Pages are ordered by row id; the total is the live count.
#[test]
fn pagination() {
    let engine = common::engine();
    let table = people(&engine);
    for i in 0..25 {
        engine
            .insert_row(table.id, &common::attrs(&[("age", Value::Integer(i))]))
            .unwrap();
    }

    let first = engine.list_rows(table.id, Page::first()).unwrap();
    assert_eq!(first.total_rows, 25);
    assert_eq!(first.rows.len(), 10);
    assert_eq!(first.rows[0].id, RowId::from_raw(1));

    let last = engine.list_rows(table.id, Page::new(2, 10)).unwrap();
    assert_eq!(last.rows.len(), 5);
    assert_eq!(last.rows[4].get("age"), Some(&Value::Integer(24)));

    let names: Vec<&str> = first.rows[0].values.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["row_id", "name", "age", "city", "created_at", "updated_at"]);
}

/// A fractional value in an integer column widens it once, then is stored.
#[test]
fn fractional_value_widens_once() {
    let engine = common::engine();
    let table = people(&engine);
    engine
        .insert_row(table.id, &common::attrs(&[("age", Value::Integer(30))]))
        .unwrap();

    let id = engine
        .insert_row(table.id, &common::attrs(&[("name", Value::from("Javi")), ("age", Value::from("25.4"))]))
        .unwrap();

    let age = engine
        .describe(table.id)
        .unwrap()
        .into_iter()
        .find(|c| c.name == "age")
        .unwrap();
    assert_eq!(age.type_name(TypeFormat::Internal), "double precision");
    assert_eq!(age.public_type(), PublicType::Number);
    assert_eq!(engine.get_row(table.id, id).unwrap().get("age"), Some(&Value::Float(25.4)));
    assert_eq!(engine.get_row(table.id, RowId::from_raw(1)).unwrap().get("age"), Some(&Value::Float(30.0)));

    // Already wide: no further change.
    engine
        .insert_row(table.id, &common::attrs(&[("age", Value::Float(1.5))]))
        .unwrap();
    let types: Vec<String> = engine
        .describe(table.id)
        .unwrap()
        .into_iter()
        .map(|c| c.type_name(TypeFormat::Internal))
        .collect();
    assert_eq!(types.iter().filter(|t| *t == "double precision").count(), 1);
    assert_eq!(engine.table(table.id).unwrap().rows_counted, 3);
}

/// A whole number too large for an integer column widens it instead of
/// being clamped.
#[test]
fn huge_whole_number_widens() {
    let engine = common::engine();
    let table = people(&engine);
    let id = engine
        .insert_row(table.id, &common::attrs(&[("age", Value::Float(1e20))]))
        .unwrap();
    let text_id = engine
        .insert_row(table.id, &common::attrs(&[("age", Value::from("1e20"))]))
        .unwrap();

    let age = engine
        .describe(table.id)
        .unwrap()
        .into_iter()
        .find(|c| c.name == "age")
        .unwrap();
    assert_eq!(age.type_name(TypeFormat::Internal), "double precision");
    for row in [id, text_id] {
        assert_eq!(engine.get_row(table.id, row).unwrap().get("age"), Some(&Value::Float(1e20)));
    }
}

/// Points computed from lat/lon reproject back to the same coordinates.
#[test]
fn lat_lon_point_round_trip() {
    let engine = common::engine();
    let table = engine
        .create_table(
            OWNER,
            &NewTable::named("points").with_schema("name text, lat double precision, lon double precision"),
        )
        .unwrap();
    engine.set_lat_lon(table.id, Some(("lat", "lon"))).unwrap();

    let id = engine
        .insert_row(
            table.id,
            &common::attrs(&[("lat", Value::Float(3.769)), ("lon", Value::Float(40.321))]),
        )
        .unwrap();

    let point = engine.row_point(table.id, id).unwrap().unwrap();
    assert_eq!(common::round(point.lat, 3), 3.769);
    assert_eq!(common::round(point.lon, 3), 40.321);

    // Touching other columns leaves the point alone.
    engine
        .update_row(table.id, id, &common::attrs(&[("name", Value::from("x"))]))
        .unwrap();
    assert!(engine.row_point(table.id, id).unwrap().is_some());

    // Clearing a coordinate clears the point.
    engine
        .update_row(table.id, id, &common::attrs(&[("lat", Value::Null)]))
        .unwrap();
    assert_eq!(engine.row_point(table.id, id).unwrap(), None);
}

/// The address role geocodes on writes; failures and misses store no point.
#[test]
fn address_role_geocodes() {
    let geocoder = StubGeocoder::new(&[("Calle de la Palma 72, Madrid", 40.4268, -3.7089)]);
    let engine = common::engine_with_geocoder(geocoder.clone());
    let table = people(&engine);
    engine.set_address(table.id, "city").unwrap();

    let found = engine
        .insert_row(table.id, &common::attrs(&[("city", Value::from("Calle de la Palma 72, Madrid"))]))
        .unwrap();
    let missed = engine
        .insert_row(table.id, &common::attrs(&[("city", Value::from("Nowhere"))]))
        .unwrap();
    let failed = engine
        .insert_row(table.id, &common::attrs(&[("city", Value::from("fail"))]))
        .unwrap();
    let empty = engine.insert_row(table.id, &common::attrs(&[])).unwrap();

    let point = engine.row_point(table.id, found).unwrap().unwrap();
    assert_eq!(common::round(point.lat, 4), 40.4268);
    assert_eq!(engine.row_point(table.id, missed).unwrap(), None);
    assert_eq!(engine.row_point(table.id, failed).unwrap(), None);
    assert_eq!(engine.row_point(table.id, empty).unwrap(), None);
    assert_eq!(geocoder.calls(), 3);
}

/// With both roles set the address wins; an explicit lat/lon pair sets the
/// point directly and is written to the role columns.
#[test]
fn update_geometry() {
    let geocoder = StubGeocoder::new(&[("Valencia", 39.47, -0.376)]);
    let engine = common::engine_with_geocoder(geocoder.clone());
    let table = engine
        .create_table(
            OWNER,
            &NewTable::named("both").with_schema("place text, latitude real, longitude real"),
        )
        .unwrap();
    assert_eq!(table.roles.lat_lon(), Some(("latitude", "longitude")));
    engine.set_address(table.id, "place").unwrap();

    let id = engine
        .insert_row(
            table.id,
            &common::attrs(&[
                ("place", Value::from("Valencia")),
                ("latitude", Value::Float(1.0)),
                ("longitude", Value::Float(1.0)),
            ]),
        )
        .unwrap();
    let point = engine.row_point(table.id, id).unwrap().unwrap();
    assert_eq!(common::round(point.lat, 2), 39.47);

    engine
        .update_geometry(table.id, id, &GeometryInput::lat_lon(10.5, 20.25))
        .unwrap();
    let point = engine.row_point(table.id, id).unwrap().unwrap();
    assert_eq!(common::round(point.lat, 2), 10.5);
    assert_eq!(common::round(point.lon, 2), 20.25);
    let row = engine.get_row(table.id, id).unwrap();
    assert_eq!(row.get("latitude"), Some(&Value::Float(10.5)));
    assert_eq!(row.get("place"), Some(&Value::from("Valencia")));

    engine
        .update_geometry(table.id, id, &GeometryInput::address("Nowhere"))
        .unwrap();
    assert_eq!(engine.row_point(table.id, id).unwrap(), None);
    assert_eq!(engine.get_row(table.id, id).unwrap().get("place"), Some(&Value::from("Nowhere")));

    assert!(matches!(
        engine.update_geometry(table.id, RowId::from_raw(42), &GeometryInput::address("x")),
        Err(Error::NotFound(_))
    ));
}

/// Setting the address role geocodes rows that already exist.
#[test]
fn existing_rows_are_geocoded() {
    let geocoder = StubGeocoder::new(&[("Sevilla", 37.389, -5.984)]);
    let engine = common::engine_with_geocoder(geocoder.clone());
    let table = people(&engine);
    let id = engine
        .insert_row(table.id, &common::attrs(&[("city", Value::from("Sevilla"))]))
        .unwrap();
    assert_eq!(engine.row_point(table.id, id).unwrap(), None);

    engine.set_address(table.id, "city").unwrap();
    let point = engine.row_point(table.id, id).unwrap().unwrap();
    assert_eq!(common::round(point.lat, 3), 37.389);
}

/// Writers on several threads, some of them forcing a widening.
#[test]
fn concurrent_writers() {
    let engine = Arc::new(common::engine());
    let table = people(&engine);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..25 {
                    let age = if t == 3 && i == 10 { Value::from("1.5") } else { Value::Integer(i) };
                    engine
                        .insert_row(table.id, &common::attrs(&[("age", age)]))
                        .expect("insert");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    assert_eq!(engine.list_rows(table.id, Page::first()).unwrap().total_rows, 100);
    assert_eq!(engine.table(table.id).unwrap().rows_counted, 100);
    let age = engine
        .describe(table.id)
        .unwrap()
        .into_iter()
        .find(|c| c.name == "age")
        .unwrap();
    assert_eq!(age.type_name(TypeFormat::Internal), "double precision");
}
