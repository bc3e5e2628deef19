//! # Geometry Column Tracker
//!
//! Every backing table carries a hidden `the_geom` column holding one point
//! per row. Which columns feed that point is recorded as the table's
//! *geometry roles*:
//!
//! | Role | Source | Point |
//! |------|--------|-------|
//! | lat/lon | two numeric columns | computed directly |
//! | address | one string column, or the synthetic `aggregated_address` | geocoded |
//!
//! When both roles are set the address wins.
//!
//! ## Role State Machine
//!
//! Structural changes to a role column are fed to [`GeometryRoles::apply`]
//! as [`ColumnEvent`]s, inside the same transaction as the DDL:
//!
//! ```text
//!   Renamed(from, to)      pointer (or address source) follows the rename
//!   Retyped(col, number)   lat/lon kept; address cleared
//!   Retyped(col, string)   address kept; lat/lon pair cleared
//!   Dropped(col)           role cleared (lat/lon as a pair; a dropped
//!                          aggregated source clears the address)
//! ```
//!
//! After a role is cleared the stored points are recomputed from whatever
//! role remains, or nulled.
//!
//! ## Storage Format
//!
//! Points are stored as EWKT text in Web Mercator, `SRID=3857;POINT(x y)`,
//! and projected back to latitude/longitude when read.

use std::f64::consts::PI;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::catalog;
use crate::codec::{from_sql_untyped, present};
use crate::error::{Error, Result};
use crate::geocoder::Geocoder;
use crate::introspect;
use crate::storage::{self, quote_ident, StoredColumn, GEOMETRY_SRID};
use crate::type_map::{InternalType, PublicType};
use crate::types::{
    is_reserved_column, ColumnDescriptor, GeometryRoles, ManagedTable, RowId, Value,
    AGGREGATED_ADDRESS_COLUMN, GEOMETRY_COLUMN, ROW_ID_COLUMN,
};

// =============================================================================
// Points
// =============================================================================

/// Earth radius used by the spherical Web Mercator projection, in meters.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude beyond which Web Mercator is undefined; values are clamped.
const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

/// A point in geographic coordinates (WGS 84 degrees).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Builds a point, rejecting coordinates outside the valid ranges.
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lon.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lon);
        valid.then_some(Self { lat, lon })
    }

    /// Projects to Web Mercator `(x, y)` meters.
    pub fn to_mercator(&self) -> (f64, f64) {
        let lat = self.lat.clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE);
        let x = EARTH_RADIUS_M * self.lon.to_radians();
        let y = EARTH_RADIUS_M * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
        (x, y)
    }

    /// Inverse of [`GeoPoint::to_mercator`].
    pub fn from_mercator(x: f64, y: f64) -> Self {
        let lon = (x / EARTH_RADIUS_M).to_degrees();
        let lat = (2.0 * (y / EARTH_RADIUS_M).exp().atan() - PI / 2.0).to_degrees();
        Self { lat, lon }
    }

    /// Renders the stored form, `SRID=3857;POINT(x y)`.
    pub fn to_ewkt(&self) -> String {
        let (x, y) = self.to_mercator();
        format!("SRID={GEOMETRY_SRID};POINT({x} {y})")
    }
}

/// Parses a stored point. Returns `None` for anything but a Web Mercator
/// EWKT point.
pub fn parse_ewkt(raw: &str) -> Option<GeoPoint> {
    let rest = raw.trim().strip_prefix("SRID=")?;
    let (srid, wkt) = rest.split_once(';')?;
    if srid.trim().parse::<i64>().ok()? != GEOMETRY_SRID {
        return None;
    }
    let wkt = wkt.trim();
    let head = wkt.get(..5)?;
    if !head.eq_ignore_ascii_case("point") {
        return None;
    }
    let coords = wkt[5..].trim().strip_prefix('(')?.strip_suffix(')')?;
    let mut parts = coords.split_whitespace();
    let x = parts.next()?.parse::<f64>().ok()?;
    let y = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() || !x.is_finite() || !y.is_finite() {
        return None;
    }
    Some(GeoPoint::from_mercator(x, y))
}

/// Computes a point from latitude and longitude cell values.
pub fn point_from_values(lat: &Value, lon: &Value) -> Option<GeoPoint> {
    GeoPoint::new(lat.as_f64()?, lon.as_f64()?)
}

/// Joins the non-empty parts of an aggregated address with `,`.
pub fn aggregate_address<'a>(parts: impl IntoIterator<Item = &'a Value>) -> String {
    parts
        .into_iter()
        .map(Value::to_text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Role State Machine
// =============================================================================

/// A structural change to one column, as seen by the role tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnEvent {
    Renamed { from: String, to: String },
    Retyped { column: String, to: PublicType },
    Dropped { column: String },
}

impl GeometryRoles {
    /// Applies one column event. Returns true when a role was cleared, in
    /// which case stored points must be recomputed.
    pub fn apply(&mut self, event: &ColumnEvent) -> bool {
        match event {
            ColumnEvent::Renamed { from, to } => {
                for pointer in [&mut self.latitude, &mut self.longitude, &mut self.address] {
                    if pointer.as_deref() == Some(from.as_str()) {
                        *pointer = Some(to.clone());
                    }
                }
                for source in self.address_sources.iter_mut() {
                    if source == from {
                        *source = to.clone();
                    }
                }
                false
            }
            ColumnEvent::Retyped { column, to } => {
                let mut cleared = false;
                if self.is_lat_lon(column) && *to != PublicType::Number {
                    self.clear_lat_lon();
                    cleared = true;
                }
                if self.address.as_deref() == Some(column.as_str()) && *to != PublicType::String {
                    self.clear_address();
                    cleared = true;
                }
                cleared
            }
            ColumnEvent::Dropped { column } => {
                let mut cleared = false;
                if self.is_lat_lon(column) {
                    self.clear_lat_lon();
                    cleared = true;
                }
                if self.address.as_deref() == Some(column.as_str())
                    || self.address_sources.iter().any(|s| s == column)
                {
                    self.clear_address();
                    cleared = true;
                }
                cleared
            }
        }
    }

    fn is_lat_lon(&self, column: &str) -> bool {
        self.latitude.as_deref() == Some(column) || self.longitude.as_deref() == Some(column)
    }

    fn clear_lat_lon(&mut self) {
        self.latitude = None;
        self.longitude = None;
    }

    fn clear_address(&mut self) {
        self.address = None;
        self.address_sources.clear();
    }

    /// Every column feeding the point (role columns and address sources).
    pub fn source_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = [&self.latitude, &self.longitude, &self.address]
            .into_iter()
            .filter_map(|c| c.as_deref())
            .collect();
        columns.extend(self.address_sources.iter().map(String::as_str));
        columns
    }
}

/// Applies column events to a table's roles, persists them, and recomputes
/// points when a role was cleared.
pub fn apply_column_events(
    conn: &Connection,
    table: &mut ManagedTable,
    events: &[ColumnEvent],
) -> Result<()> {
    let before = table.roles.clone();
    let mut cleared = false;
    for event in events {
        cleared |= table.roles.apply(event);
    }
    if table.roles == before {
        return Ok(());
    }

    catalog::update_roles(conn, table.id, &table.roles)?;
    if cleared {
        info!(table_id = table.id.as_raw(), "geometry role cleared by column change");
        recompute_points(conn, table)?;
    }
    Ok(())
}

// =============================================================================
// Point Sources
// =============================================================================

/// Where a row's point comes from on a write.
#[derive(Debug, Clone, PartialEq)]
pub enum PointSource {
    /// No role is affected; leave the stored point alone.
    Keep,
    /// A point known without geocoding (possibly none).
    Direct(Option<GeoPoint>),
    /// An address to geocode.
    Address(String),
}

/// Decides the point source for a row from its (merged) values.
pub fn point_source(roles: &GeometryRoles, lookup: impl Fn(&str) -> Value) -> PointSource {
    if let Some(address) = &roles.address {
        let text = lookup(address).to_text();
        let text = text.trim();
        return if text.is_empty() {
            PointSource::Direct(None)
        } else {
            PointSource::Address(text.to_string())
        };
    }
    match roles.lat_lon() {
        Some((lat, lon)) => PointSource::Direct(point_from_values(&lookup(lat), &lookup(lon))),
        None => PointSource::Keep,
    }
}

/// The point to store after resolution. `None` means "leave as is".
pub type PointUpdate = Option<Option<GeoPoint>>;

/// Resolves a point source, geocoding addresses.
///
/// Must not be called with the connection locked.
pub fn resolve_point(source: &PointSource, geocoder: &dyn Geocoder) -> PointUpdate {
    match source {
        PointSource::Keep => None,
        PointSource::Direct(point) => Some(*point),
        PointSource::Address(address) => Some(geocode_point(geocoder, address)),
    }
}

/// Geocodes an address. Failures are logged and yield no point.
pub fn geocode_point(geocoder: &dyn Geocoder, address: &str) -> Option<GeoPoint> {
    match geocoder.geocode(address) {
        Ok(point) => {
            if point.is_none() {
                debug!(address, "address not found by geocoder");
            }
            point
        }
        Err(e) => {
            warn!(address, error = %e, "geocoding failed, storing empty point");
            None
        }
    }
}

// =============================================================================
// Stored Points
// =============================================================================

/// Writes (or clears) the point of one row.
pub fn write_point(
    conn: &Connection,
    ident: &str,
    row_id: RowId,
    point: Option<GeoPoint>,
) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            quote_ident(ident),
            quote_ident(GEOMETRY_COLUMN),
            quote_ident(ROW_ID_COLUMN)
        ),
        params![point.map(|p| p.to_ewkt()), row_id.as_raw()],
    )?;
    Ok(())
}

/// Reads the point of one row, projected back to latitude/longitude.
///
/// # Errors
///
/// `Error::NotFound` when the row doesn't exist.
pub fn read_point(conn: &Connection, table: &ManagedTable, row_id: RowId) -> Result<Option<GeoPoint>> {
    let stored: Option<Option<String>> = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE {} = ?",
                quote_ident(GEOMETRY_COLUMN),
                quote_ident(&table.storage_ident()),
                quote_ident(ROW_ID_COLUMN)
            ),
            [row_id.as_raw()],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        None => Err(Error::NotFound(format!("{row_id} in {}", table.id))),
        Some(raw) => Ok(raw.as_deref().and_then(parse_ewkt)),
    }
}

/// Recomputes every stored point from the current roles, without geocoding.
///
/// With an address role the points are geocoded results and stay as they
/// are. Otherwise they come from the lat/lon role, or are nulled.
pub fn recompute_points(conn: &Connection, table: &ManagedTable) -> Result<()> {
    let ident = table.storage_ident();
    if table.roles.address.is_some() {
        return Ok(());
    }

    let Some((lat, lon)) = table.roles.lat_lon() else {
        conn.execute(
            &format!(
                "UPDATE {} SET {} = NULL",
                quote_ident(&ident),
                quote_ident(GEOMETRY_COLUMN)
            ),
            [],
        )?;
        return Ok(());
    };

    let pairs = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, {}, {} FROM {}",
            quote_ident(ROW_ID_COLUMN),
            quote_ident(lat),
            quote_ident(lon),
            quote_ident(&ident)
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    RowId::from_raw(row.get(0)?),
                    from_sql_untyped(row.get(1)?),
                    from_sql_untyped(row.get(2)?),
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    for (row_id, lat, lon) in pairs {
        write_point(conn, &ident, row_id, point_from_values(&lat, &lon))?;
    }
    Ok(())
}

// =============================================================================
// Role Assignment
// =============================================================================

fn require_column(conn: &Connection, table: &ManagedTable, name: &str) -> Result<ColumnDescriptor> {
    if is_reserved_column(name) {
        return Err(Error::ProtectedColumn(name.to_string()));
    }
    introspect::find_column(conn, table, name)?.ok_or_else(|| Error::ColumnNotFound(name.to_string()))
}

fn require_type(column: &ColumnDescriptor, expected: PublicType) -> Result<()> {
    if column.public_type() != expected {
        return Err(Error::InvalidColumnType {
            column: column.name.clone(),
            expected: expected.to_string(),
            actual: column.public_type().to_string(),
        });
    }
    Ok(())
}

/// Sets or clears the lat/lon role and recomputes points.
pub fn assign_lat_lon(
    conn: &Connection,
    table: &mut ManagedTable,
    columns: Option<(&str, &str)>,
) -> Result<()> {
    match columns {
        Some((lat, lon)) => {
            for name in [lat, lon] {
                let column = require_column(conn, table, name)?;
                require_type(&column, PublicType::Number)?;
            }
            table.roles.latitude = Some(lat.to_string());
            table.roles.longitude = Some(lon.to_string());
        }
        None => {
            table.roles.latitude = None;
            table.roles.longitude = None;
        }
    }

    catalog::update_roles(conn, table.id, &table.roles)?;
    recompute_points(conn, table)?;
    info!(
        table_id = table.id.as_raw(),
        latitude = ?table.roles.latitude,
        longitude = ?table.roles.longitude,
        "lat/lon role updated"
    );
    Ok(())
}

/// Sets or clears the address role.
///
/// `spec` is one column name, a comma-joined list of two or more (which
/// creates or reuses the `aggregated_address` column), or empty to clear the
/// role. Returns the addresses of existing rows, which the caller geocodes
/// and stores with [`write_point`] once the connection is released.
pub fn assign_address(
    conn: &Connection,
    table: &mut ManagedTable,
    spec: &str,
) -> Result<Vec<(RowId, String)>> {
    let names: Vec<&str> = spec.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();

    match names.as_slice() {
        [] => {
            table.roles.address = None;
            table.roles.address_sources.clear();
            catalog::update_roles(conn, table.id, &table.roles)?;
            recompute_points(conn, table)?;
            info!(table_id = table.id.as_raw(), "address role cleared");
            return Ok(Vec::new());
        }
        [single] => {
            let column = require_column(conn, table, single)?;
            require_type(&column, PublicType::String)?;
            table.roles.address = Some(column.name);
            table.roles.address_sources.clear();
        }
        sources => {
            for source in sources {
                require_column(conn, table, source)?;
            }
            let ident = table.storage_ident();
            match introspect::find_column(conn, table, AGGREGATED_ADDRESS_COLUMN)? {
                Some(existing) => require_type(&existing, PublicType::String)?,
                None => storage::add_column(
                    conn,
                    &ident,
                    &StoredColumn::new(AGGREGATED_ADDRESS_COLUMN, InternalType::Varchar(None)),
                )?,
            }
            table.roles.address = Some(AGGREGATED_ADDRESS_COLUMN.to_string());
            table.roles.address_sources = sources.iter().map(|s| s.to_string()).collect();
            fill_aggregated_address(conn, table)?;
        }
    }

    catalog::update_roles(conn, table.id, &table.roles)?;
    info!(
        table_id = table.id.as_raw(),
        address = ?table.roles.address,
        sources = ?table.roles.address_sources,
        "address role updated"
    );
    pending_addresses(conn, table)
}

/// Recomputes `aggregated_address` for every row.
fn fill_aggregated_address(conn: &Connection, table: &ManagedTable) -> Result<()> {
    let ident = table.storage_ident();
    let columns = introspect::describe(conn, table)?;
    let sources: Vec<(String, InternalType)> = table
        .roles
        .address_sources
        .iter()
        .filter_map(|s| {
            columns
                .iter()
                .find(|c| &c.name == s)
                .map(|c| (c.name.clone(), c.internal_type))
        })
        .collect();

    let select = sources
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");
    let rows = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, {select} FROM {}",
            quote_ident(ROW_ID_COLUMN),
            quote_ident(&ident)
        ))?;
        let rows = stmt
            .query_map([], |row| {
                let mut parts = Vec::with_capacity(sources.len());
                for (i, (_, ty)) in sources.iter().enumerate() {
                    parts.push(present(row.get(i + 1)?, *ty));
                }
                Ok((row.get::<_, i64>(0)?, aggregate_address(&parts)))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let mut update = conn.prepare(&format!(
        "UPDATE {} SET {} = ? WHERE {} = ?",
        quote_ident(&ident),
        quote_ident(AGGREGATED_ADDRESS_COLUMN),
        quote_ident(ROW_ID_COLUMN)
    ))?;
    for (row_id, address) in rows {
        let value = if address.is_empty() { None } else { Some(address) };
        update.execute(params![value, row_id])?;
    }
    Ok(())
}

/// Rows whose point must be geocoded: every row with a non-empty address.
/// Rows with an empty address get a null point right away.
fn pending_addresses(conn: &Connection, table: &ManagedTable) -> Result<Vec<(RowId, String)>> {
    let Some(address) = table.roles.address.as_deref() else {
        return Ok(Vec::new());
    };
    let ident = table.storage_ident();
    let rows = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, {} FROM {} ORDER BY {}",
            quote_ident(ROW_ID_COLUMN),
            quote_ident(address),
            quote_ident(&ident),
            quote_ident(ROW_ID_COLUMN)
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((RowId::from_raw(row.get(0)?), from_sql_untyped(row.get(1)?)))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    // Points derived from another role are stale from here on; rows stay
    // without a point until their address is geocoded.
    conn.execute(
        &format!("UPDATE {} SET {} = NULL", quote_ident(&ident), quote_ident(GEOMETRY_COLUMN)),
        [],
    )?;

    Ok(rows
        .into_iter()
        .map(|(row_id, value)| (row_id, value.to_text().trim().to_string()))
        .filter(|(_, text)| !text.is_empty())
        .collect())
}
