//! # Domain Types for dyntable
//!
//! This module defines the core types shared by every component: identifiers,
//! values, rows, column descriptors, and the managed-table record itself.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Table ids, owner ids, and row ids are all `i64` in SQLite. Wrapping each
//! in its own single-field struct means a `RowId` can't be passed where a
//! `TableId` is expected:
//!
//! ```rust
//! use dyntable::types::{RowId, TableId};
//!
//! fn example(table: TableId, row: RowId) {
//!     // table == row  // Won't compile
//! }
//! ```

use std::fmt;

use crate::type_map::{InternalType, PublicType};

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw database id.
            pub const fn from_raw(raw: i64) -> Self {
                Self(raw)
            }

            /// Returns the raw database id.
            pub fn as_raw(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, " {}"), self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

id_newtype!(
    /// Identifies the user owning managed tables. Users themselves live
    /// outside this crate; we only keep their table counter.
    OwnerId,
    "owner"
);

id_newtype!(
    /// Identifies a managed table in the catalog.
    TableId,
    "table"
);

id_newtype!(
    /// The reserved auto-incrementing row id of a managed table.
    RowId,
    "row"
);

// =============================================================================
// Reserved Columns
// =============================================================================

/// The synthetic auto-incrementing row id. Always first.
pub const ROW_ID_COLUMN: &str = "row_id";

/// Creation timestamp. Second to last.
pub const CREATED_AT_COLUMN: &str = "created_at";

/// Update timestamp. Always last.
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Hidden column holding the row's spatial point.
pub const GEOMETRY_COLUMN: &str = "the_geom";

/// Name of the synthetic column created for a multi-column address role.
pub const AGGREGATED_ADDRESS_COLUMN: &str = "aggregated_address";

/// Returns true for every column structural operations must never touch.
pub fn is_reserved_column(name: &str) -> bool {
    matches!(
        name,
        ROW_ID_COLUMN | CREATED_AT_COLUMN | UPDATED_AT_COLUMN | GEOMETRY_COLUMN
    )
}

// =============================================================================
// Values
// =============================================================================

/// A single cell value, as written by callers and presented by reads.
///
/// Reads always present values in their public shape: numbers as `Integer`
/// or `Float`, booleans as `Boolean`, and everything else (text, dates) as
/// `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl Value {
    /// Returns true for `Value::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the text content, if this is a `Text` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a float when it is (or parses as) a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    /// Renders the value as plain text; `Null` becomes the empty string.
    ///
    /// Used when concatenating address parts and for error messages.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Boolean(b) => b.to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column name → value pairs for inserts and updates.
pub type Attributes = std::collections::BTreeMap<String, Value>;

// =============================================================================
// Rows
// =============================================================================

/// One row of a managed table, in presentation column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// The reserved row id.
    pub id: RowId,
    /// Every column (reserved ones included) with its public-shaped value.
    pub values: Vec<(String, Value)>,
}

impl Row {
    /// Looks up a column's value by name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }
}

/// Zero-based pagination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Zero-based page index.
    pub page: u32,
    /// Rows per page. `None` uses the configured default.
    pub per_page: Option<u32>,
}

impl Page {
    /// The first page with the configured default size.
    pub fn first() -> Self {
        Self { page: 0, per_page: None }
    }

    /// A specific page with an explicit size.
    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page: Some(per_page) }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first()
    }
}

/// One page of rows plus the live total.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPage {
    pub rows: Vec<Row>,
    /// Live `COUNT(*)` of the backing table, not the cached counter.
    pub total_rows: u64,
}

// =============================================================================
// Columns
// =============================================================================

/// Semantic role a column plays in computing the table's spatial point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnRole {
    Latitude,
    Longitude,
    Address,
}

impl ColumnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnRole::Latitude => "latitude",
            ColumnRole::Longitude => "longitude",
            ColumnRole::Address => "address",
        }
    }
}

impl fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which type name [`ColumnDescriptor::type_name`] renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeFormat {
    /// The declared storage type (`integer`, `character varying`, ...).
    #[default]
    Internal,
    /// The public name (`number`, `string`, ...).
    Public,
}

/// A column of a managed table as read from live storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub internal_type: InternalType,
    pub role: Option<ColumnRole>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, internal_type: InternalType) -> Self {
        Self {
            name: name.into(),
            internal_type,
            role: None,
        }
    }

    /// The public type, derived through the Type Mapper.
    pub fn public_type(&self) -> PublicType {
        self.internal_type.to_public()
    }

    /// Renders the column's type in the requested format.
    pub fn type_name(&self, format: TypeFormat) -> String {
        match format {
            TypeFormat::Internal => self.internal_type.sql_name(),
            TypeFormat::Public => self.public_type().as_str().to_string(),
        }
    }

    /// True for `row_id`, `created_at`, and `updated_at`.
    pub fn is_reserved(&self) -> bool {
        is_reserved_column(&self.name)
    }
}

/// A named structural constraint attached to a backing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintDescriptor {
    pub name: String,
    /// The column the constraint is declared on.
    pub column: String,
}

// =============================================================================
// Managed Tables
// =============================================================================

/// Visibility of a managed table. Tables are private unless made public.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privacy {
    #[default]
    Private,
    Public,
}

impl Privacy {
    pub fn as_raw(&self) -> i64 {
        match self {
            Privacy::Private => 0,
            Privacy::Public => 1,
        }
    }

    pub fn from_raw(raw: i64) -> Self {
        if raw == 1 {
            Privacy::Public
        } else {
            Privacy::Private
        }
    }
}

/// The columns currently holding each geometry role.
///
/// The lat/lon role is a pair: both pointers are set or both are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeometryRoles {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub address: Option<String>,
    /// Source columns of an aggregated address, empty for a single-column
    /// address role.
    pub address_sources: Vec<String>,
}

impl GeometryRoles {
    /// True when any role is assigned.
    pub fn any(&self) -> bool {
        self.lat_lon().is_some() || self.address.is_some()
    }

    /// The lat/lon pair, when set.
    pub fn lat_lon(&self) -> Option<(&str, &str)> {
        match (&self.latitude, &self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    /// The role a column plays, if any.
    pub fn role_of(&self, column: &str) -> Option<ColumnRole> {
        if self.address.as_deref() == Some(column) {
            Some(ColumnRole::Address)
        } else if self.latitude.as_deref() == Some(column) {
            Some(ColumnRole::Latitude)
        } else if self.longitude.as_deref() == Some(column) {
            Some(ColumnRole::Longitude)
        } else {
            None
        }
    }
}

/// A user-owned table whose schema is mutable at runtime.
///
/// This is a snapshot of the catalog row; re-read it with
/// [`Engine::table`](crate::Engine::table) after mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedTable {
    pub id: TableId,
    pub owner_id: OwnerId,
    /// Storage name: sanitized, unique per owner.
    pub name: String,
    /// The name the user asked for.
    pub display_name: String,
    pub privacy: Privacy,
    pub tags: Vec<String>,
    /// Denormalized row counter.
    pub rows_counted: u64,
    pub roles: GeometryRoles,
}

impl ManagedTable {
    /// Identifier of the backing table in the storage engine.
    pub fn storage_ident(&self) -> String {
        storage_ident(self.owner_id, &self.name)
    }

    pub fn lat_column(&self) -> Option<&str> {
        self.roles.latitude.as_deref()
    }

    pub fn lon_column(&self) -> Option<&str> {
        self.roles.longitude.as_deref()
    }

    pub fn address_column(&self) -> Option<&str> {
        self.roles.address.as_deref()
    }
}

/// Builds the physical identifier of an owner's table.
///
/// All owners share one SQLite database, so the owner id is folded into the
/// identifier and storage names only need to be unique per owner.
pub fn storage_ident(owner: OwnerId, name: &str) -> String {
    format!("u{}_{}", owner.as_raw(), name)
}

// =============================================================================
// Tests
// =============================================================================
