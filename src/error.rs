//! # Error Handling for dyntable
//!
//! This module defines the error type used throughout the crate. A single
//! error enum ([`Error`]) represents every failure mode, so callers (typically
//! a request handler) can match on one type and translate it into a protocol
//! response (not-found, bad-request, ...).
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from `#[from]`, which is what lets `?` lift a
//!   `rusqlite::Error` into ours
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Caller input | `InvalidType`, `InvalidAttributes`, `InvalidColumnType`, `InvalidForceValue` | Bad request |
//! | Structure | `ProtectedColumn`, `ColumnNotFound`, `ColumnExists`, `Cast` | Bad request / conflict |
//! | Lookup | `NotFound` | Not found |
//! | Import | `Import` | Bad request (table was not kept) |
//! | Internal | `Sqlite`, `Schema`, `Config`, `Http`, `Geocoding` | Log and investigate |
//!
//! Geocoding failures never surface from engine operations: "no usable
//! result" is a valid business outcome and produces a null point.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in dyntable operations.
///
/// # Example
///
/// ```rust,ignore
/// use dyntable::{Error, Result};
///
/// fn example(engine: &Engine, table: TableId) -> Result<()> {
///     match engine.add_column(table, "score", "numbr") {
///         Err(Error::InvalidType(name)) => eprintln!("unknown type {name}"),
///         other => { other?; }
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Caller Input Errors
    // =========================================================================

    /// A requested column type is neither a public type name nor a known
    /// internal storage type.
    #[error("invalid type '{0}'")]
    InvalidType(String),

    /// An insert or update referenced columns the table doesn't have (or that
    /// can't be written directly). The whole write is rejected.
    #[error("invalid attributes: {}", .0.join(", "))]
    InvalidAttributes(Vec<String>),

    /// A geometry role was assigned to a column of an incompatible type.
    #[error("column '{column}' has type {actual}, but the role requires {expected}")]
    InvalidColumnType {
        /// The column the role was assigned to
        column: String,
        /// Public type the role requires
        expected: String,
        /// Public type the column actually has
        actual: String,
    },

    /// A `force_value` literal couldn't be parsed.
    ///
    /// Accepted literals: `NULL`, integers, decimals, `'quoted text'`,
    /// `true`, `false`.
    #[error("invalid force value '{0}'")]
    InvalidForceValue(String),

    // =========================================================================
    // Structural Errors
    // =========================================================================

    /// A structural mutation targeted a reserved column (`row_id`,
    /// `created_at`, `updated_at`, or the hidden geometry column).
    #[error("column '{0}' is reserved and cannot be modified")]
    ProtectedColumn(String),

    /// The named column doesn't exist on the table.
    #[error("column '{0}' does not exist")]
    ColumnNotFound(String),

    /// A column with this name already exists on the table.
    #[error("column '{0}' already exists")]
    ColumnExists(String),

    /// A stored or written value couldn't be converted to the column's type.
    ///
    /// # When This Happens
    ///
    /// - `modify_column` retypes a column holding values the new type can't
    ///   represent, and no `force_value` was given
    /// - An insert/update writes a value that doesn't fit (e.g. `"abc"` into
    ///   a numeric column). Fractional numbers into integer columns are not an
    ///   error: the column is widened instead.
    #[error("cannot cast value '{value}' of column '{column}' to {target}")]
    Cast {
        /// Column being written or retyped
        column: String,
        /// Rendering of the offending value
        value: String,
        /// Target internal type name
        target: String,
    },

    // =========================================================================
    // Lookup Errors
    // =========================================================================

    /// An unknown table or row was referenced.
    #[error("{0} not found")]
    NotFound(String),

    // =========================================================================
    // Import Errors
    // =========================================================================

    /// The import source was malformed or failed mid-stream. The partially
    /// created table has already been destroyed when this is returned.
    #[error("import failed: {0}")]
    Import(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error> for Error`,
    /// so `?` converts engine errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Catalog version mismatch, or a backing table whose structure we can't
    /// interpret (e.g. a column type outside the closed type set).
    #[error("schema error: {0}")]
    Schema(String),

    /// Configuration file couldn't be read, parsed, or validated.
    #[error("config error: {0}")]
    Config(String),

    /// An HTTP request (URL import, geocoding) failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The geocoding service answered with an error status. The engine turns
    /// this into a null point; only direct [`Geocoder`](crate::Geocoder)
    /// callers see it.
    #[error("geocoding error: {0}")]
    Geocoding(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages end up in logs and API responses; keep them readable.
    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::InvalidType("textttt".to_string()).to_string(),
            "invalid type 'textttt'"
        );

        assert_eq!(
            Error::InvalidAttributes(vec!["non_existing".to_string(), "other".to_string()])
                .to_string(),
            "invalid attributes: non_existing, other"
        );

        assert_eq!(
            Error::ProtectedColumn("row_id".to_string()).to_string(),
            "column 'row_id' is reserved and cannot be modified"
        );

        let cast = Error::Cast {
            column: "age".to_string(),
            value: "abc".to_string(),
            target: "integer".to_string(),
        };
        assert_eq!(
            cast.to_string(),
            "cannot cast value 'abc' of column 'age' to integer"
        );
    }

    /// Verify that rusqlite errors convert automatically.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }
}
