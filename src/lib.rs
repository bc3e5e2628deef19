//! # dyntable - Runtime-Mutable Tables
//!
//! dyntable manages user-owned relational tables whose schema changes while
//! the application runs. It provides:
//!
//! - **Table lifecycle**: create (from a schema, defaults, or an import),
//!   rename, destroy, tags and privacy
//! - **Column DDL**: add, rename, retype (with force values), drop, all
//!   atomic
//! - **Geometry roles**: a hidden point per row, computed from lat/lon
//!   columns or geocoded from address columns, kept valid across DDL
//! - **Rows**: paginated reads and validated writes, with automatic integer
//!   widening
//! - **Imports**: CSV and JSON from files, readers or URLs, with type
//!   guessing
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Engine (api)                            │
//! │           per-table RwLocks, connection Mutex, geocoder         │
//! └──────┬──────────────┬──────────────┬──────────────┬─────────────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//!   ┌─────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!   │lifecycle│   │   ddl    │   │   rows   │   │  import  │
//!   └────┬────┘   └────┬─────┘   └────┬─────┘   └────┬─────┘
//!        │             │   ▲          │              │
//!        │             ▼   │          ▼              │
//!        │        ┌──────────┐   ┌──────────┐        │
//!        │        │ geometry │◄──│  codec   │        │
//!        │        └────┬─────┘   └──────────┘        │
//!        ▼             ▼                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        catalog / storage / introspect  (SQLite via rusqlite)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Reserved columns**: `row_id` first, `created_at`/`updated_at` last,
//!    never renamed, retyped or dropped; `the_geom` is hidden
//! 2. **Unique names**: a storage name is unique among its owner's tables
//!    (`name`, `name_2`, `name_3`, ...)
//! 3. **Valid roles**: a geometry role always points at an existing column
//!    of a compatible type, or is cleared
//! 4. **Atomic structure**: every structural change commits completely or
//!    not at all
//! 5. **Honest counters**: owner and row counters change in the same
//!    transaction as the data they count
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum
//! - [`config`]: engine configuration (TOML + environment)
//! - [`schema`]: catalog DDL and database initialization
//! - [`types`]: identifiers, values, descriptors, roles
//! - [`type_map`]: public and internal column types
//! - [`codec`]: value conversion, casts, literals
//! - [`storage`]: backing table DDL over SQLite
//! - [`catalog`]: catalog rows (tables, owners, tags)
//! - [`introspect`]: live column descriptions
//! - [`ddl`]: column changes and schema specs
//! - [`geometry`] / [`geocoder`]: points, roles, geocoding
//! - [`rows`]: row reads and writes
//! - [`lifecycle`]: table creation, rename, destruction
//! - [`import`]: CSV/JSON import
//! - [`api`]: the [`Engine`] entry point

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for dyntable operations.
///
/// A single error enum covers caller mistakes, structural conflicts, lookups
/// and engine failures.
pub mod error;

/// Engine configuration loaded from TOML with environment overrides.
pub mod config;

/// Catalog DDL and database initialization.
///
/// Creates the `owners`, `managed_tables`, `tags` and `dyntable_metadata`
/// tables and checks the catalog version.
pub mod schema;

/// Domain types: identifiers, values, rows, column descriptors and roles.
pub mod types;

/// The closed sets of public and internal column types and the mapping
/// between them.
pub mod type_map;

/// Conversion between domain values and SQLite values, casts and literals.
pub mod codec;

/// Backing table DDL: create, rename, drop, column changes, table rebuilds.
pub mod storage;

/// Catalog rows for managed tables, owners and tags.
pub mod catalog;

/// Live column descriptions of a managed table.
pub mod introspect;

/// Column-level DDL with validation and role maintenance.
pub mod ddl;

/// Points, geometry roles and the role state machine.
pub mod geometry;

/// Address geocoding: the trait, an HTTP client and an LRU cache.
pub mod geocoder;

/// Paginated reads and validated, widening writes.
pub mod rows;

/// Table creation, renaming and destruction.
pub mod lifecycle;

/// CSV and JSON imports with type guessing.
pub mod import;

/// The engine: locking, transactions and the public operations.
///
/// The main entry point is [`Engine`](api::Engine).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::Engine;
pub use config::EngineConfig;
pub use ddl::ColumnChange;
pub use error::{Error, Result};
pub use geocoder::{CachingGeocoder, Geocoder, HttpGeocoder, NoopGeocoder};
pub use geometry::GeoPoint;
pub use import::{ImportFormat, ImportOptions};
pub use lifecycle::NewTable;
pub use rows::GeometryInput;
pub use schema::Database;
pub use type_map::{InternalType, PublicType};

pub use types::{
    Attributes, ColumnDescriptor, ColumnRole, ConstraintDescriptor, GeometryRoles, ManagedTable,
    OwnerId, Page, Privacy, Row, RowId, RowPage, TableId, TypeFormat, Value,
};
