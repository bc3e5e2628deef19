//! # Type Mapper
//!
//! Bidirectional mapping between the internal storage types of a managed
//! table and the simplified public type names shown to end users.
//!
//! ```text
//!   internal (many)                     public (closed set)
//!   ───────────────                     ───────────────────
//!   smallint, integer, bigint,   ──►    number  ──► integer
//!   real, double precision,
//!   numeric
//!   text, character varying(n),  ──►    string  ──► character varying
//!   character(n)
//!   date, timestamp              ──►    date    ──► timestamp
//!   boolean                      ──►    boolean ──► boolean
//!   geometry                     ──►    geometry──► geometry
//! ```
//!
//! Both sets are closed enums. User-supplied type strings are parsed into them
//! before any DDL is issued, so no unchecked string ever reaches the engine.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// =============================================================================
// Public Types
// =============================================================================

/// The simplified type name exposed to end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicType {
    Number,
    String,
    Date,
    Boolean,
    Geometry,
}

impl PublicType {
    /// Every public type, in presentation order.
    pub const ALL: [PublicType; 5] = [
        PublicType::Number,
        PublicType::String,
        PublicType::Date,
        PublicType::Boolean,
        PublicType::Geometry,
    ];

    /// Returns the public name (`"number"`, `"string"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicType::Number => "number",
            PublicType::String => "string",
            PublicType::Date => "date",
            PublicType::Boolean => "boolean",
            PublicType::Geometry => "geometry",
        }
    }

    /// Parses a public type name. Case and surrounding whitespace are ignored.
    ///
    /// # Errors
    ///
    /// `Error::InvalidType` for anything outside the closed set.
    pub fn parse(name: &str) -> Result<Self> {
        let normalized = name.trim().to_ascii_lowercase();
        PublicType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| Error::InvalidType(name.to_string()))
    }

    /// Returns the canonical storage type used when a user asks for this
    /// public type.
    pub fn to_internal(self) -> InternalType {
        match self {
            PublicType::Number => InternalType::Integer,
            PublicType::String => InternalType::Varchar(None),
            PublicType::Date => InternalType::Timestamp,
            PublicType::Boolean => InternalType::Boolean,
            PublicType::Geometry => InternalType::Geometry,
        }
    }
}

impl fmt::Display for PublicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublicType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PublicType::parse(s)
    }
}

// =============================================================================
// Internal Types
// =============================================================================

/// A storage type of a backing-table column.
///
/// # Rust Pattern: Tagged Variant Instead of Strings
///
/// The declared type of a SQLite column is free text. We never trust it:
/// every declared type is parsed into this enum when read back, and every
/// type we write is rendered from it via [`InternalType::sql_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    DoublePrecision,
    Numeric,
    Text,
    /// `character varying`, with an optional length limit.
    Varchar(Option<u32>),
    /// `character`, with an optional fixed length.
    Char(Option<u32>),
    Date,
    Timestamp,
    Boolean,
    Geometry,
}

impl InternalType {
    /// Parses a declared storage type.
    ///
    /// Accepts the canonical names produced by [`InternalType::sql_name`] plus
    /// the usual aliases (`int`, `float`, `varchar(40)`, `bool`, ...). Returns
    /// `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw
            .trim()
            .to_ascii_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        let (base, args) = match normalized.find('(') {
            Some(open) => {
                let close = normalized.rfind(')')?;
                if close < open || !normalized[close + 1..].trim().is_empty() {
                    return None;
                }
                (
                    normalized[..open].trim().to_string(),
                    Some(normalized[open + 1..close].trim().to_string()),
                )
            }
            None => (normalized, None),
        };

        let length = match args.as_deref() {
            None => None,
            Some(a) => match a.parse::<u32>() {
                Ok(n) => Some(n),
                // numeric(10,2) carries precision/scale we don't track
                Err(_) if base == "numeric" || base == "decimal" => None,
                Err(_) => return None,
            },
        };

        let ty = match base.as_str() {
            "varchar" | "character varying" => return Some(InternalType::Varchar(length)),
            "char" | "character" | "bpchar" => return Some(InternalType::Char(length)),
            "numeric" | "decimal" => return Some(InternalType::Numeric),
            "smallint" | "int2" => InternalType::SmallInt,
            "integer" | "int" | "int4" => InternalType::Integer,
            "bigint" | "int8" => InternalType::BigInt,
            "real" | "float4" => InternalType::Real,
            "double precision" | "double" | "float" | "float8" => InternalType::DoublePrecision,
            "text" => InternalType::Text,
            "date" => InternalType::Date,
            "timestamp"
            | "timestamp without time zone"
            | "timestamp with time zone"
            | "timestamptz"
            | "datetime" => InternalType::Timestamp,
            "boolean" | "bool" => InternalType::Boolean,
            "geometry" => InternalType::Geometry,
            _ => return None,
        };

        // Only character types take a length argument.
        if args.is_some() {
            return None;
        }
        Some(ty)
    }

    /// Renders the canonical declared type used in DDL and shown by
    /// `describe`.
    pub fn sql_name(&self) -> String {
        match self {
            InternalType::SmallInt => "smallint".to_string(),
            InternalType::Integer => "integer".to_string(),
            InternalType::BigInt => "bigint".to_string(),
            InternalType::Real => "real".to_string(),
            InternalType::DoublePrecision => "double precision".to_string(),
            InternalType::Numeric => "numeric".to_string(),
            InternalType::Text => "text".to_string(),
            InternalType::Varchar(None) => "character varying".to_string(),
            InternalType::Varchar(Some(n)) => format!("character varying({n})"),
            InternalType::Char(None) => "character".to_string(),
            InternalType::Char(Some(n)) => format!("character({n})"),
            InternalType::Date => "date".to_string(),
            InternalType::Timestamp => "timestamp".to_string(),
            InternalType::Boolean => "boolean".to_string(),
            InternalType::Geometry => "geometry".to_string(),
        }
    }

    /// Maps this storage type to its public name.
    pub fn to_public(&self) -> PublicType {
        match self {
            InternalType::SmallInt
            | InternalType::Integer
            | InternalType::BigInt
            | InternalType::Real
            | InternalType::DoublePrecision
            | InternalType::Numeric => PublicType::Number,
            InternalType::Text | InternalType::Varchar(_) | InternalType::Char(_) => {
                PublicType::String
            }
            InternalType::Date | InternalType::Timestamp => PublicType::Date,
            InternalType::Boolean => PublicType::Boolean,
            InternalType::Geometry => PublicType::Geometry,
        }
    }

    /// True for the integer family, the only types that get widened.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            InternalType::SmallInt | InternalType::Integer | InternalType::BigInt
        )
    }

    /// True for any type presented as `number`.
    pub fn is_numeric(&self) -> bool {
        self.to_public() == PublicType::Number
    }

    /// True for any type presented as `string`.
    pub fn is_text(&self) -> bool {
        self.to_public() == PublicType::String
    }
}

impl fmt::Display for InternalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}

// =============================================================================
// Requested Types
// =============================================================================

/// Resolves a type requested by a user for `add_column` / `modify_column`.
///
/// Public names win (`"number"` → `integer`); otherwise the name must be a
/// known storage type (`"text"`, `"varchar(40)"`, `"real"`, ...).
///
/// # Errors
///
/// `Error::InvalidType` when the name is neither.
pub fn resolve_requested_type(name: &str) -> Result<InternalType> {
    if let Ok(public) = PublicType::parse(name) {
        return Ok(public.to_internal());
    }
    InternalType::parse(name).ok_or_else(|| Error::InvalidType(name.to_string()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_names_map_to_canonical_storage() {
        assert_eq!(PublicType::Number.to_internal(), InternalType::Integer);
        assert_eq!(PublicType::String.to_internal(), InternalType::Varchar(None));
        assert_eq!(PublicType::Date.to_internal(), InternalType::Timestamp);
        assert_eq!(PublicType::Boolean.to_internal(), InternalType::Boolean);
    }

    /// Several numeric precisions collapse to one public name.
    #[test]
    fn test_internal_to_public_is_many_to_one() {
        for ty in [
            InternalType::SmallInt,
            InternalType::Integer,
            InternalType::BigInt,
            InternalType::Real,
            InternalType::DoublePrecision,
            InternalType::Numeric,
        ] {
            assert_eq!(ty.to_public(), PublicType::Number, "{ty}");
        }
        assert_eq!(InternalType::Char(Some(5)).to_public(), PublicType::String);
        assert_eq!(InternalType::Timestamp.to_public(), PublicType::Date);
    }

    #[test]
    fn test_parse_aliases_and_lengths() {
        assert_eq!(InternalType::parse("INTEGER"), Some(InternalType::Integer));
        assert_eq!(InternalType::parse("float"), Some(InternalType::DoublePrecision));
        assert_eq!(InternalType::parse("varchar(40)"), Some(InternalType::Varchar(Some(40))));
        assert_eq!(InternalType::parse("char(5)"), Some(InternalType::Char(Some(5))));
        assert_eq!(InternalType::parse("numeric(10, 2)"), Some(InternalType::Numeric));
        assert_eq!(
            InternalType::parse("  Double   Precision "),
            Some(InternalType::DoublePrecision)
        );
        assert_eq!(InternalType::parse("integer(4)"), None);
        assert_eq!(InternalType::parse("textttt"), None);
    }

    /// Whatever we write as a declared type must parse back to the same value.
    #[test]
    fn test_sql_name_parses_back() {
        for ty in [
            InternalType::SmallInt,
            InternalType::Integer,
            InternalType::BigInt,
            InternalType::Real,
            InternalType::DoublePrecision,
            InternalType::Numeric,
            InternalType::Text,
            InternalType::Varchar(None),
            InternalType::Varchar(Some(255)),
            InternalType::Char(None),
            InternalType::Char(Some(5)),
            InternalType::Date,
            InternalType::Timestamp,
            InternalType::Boolean,
            InternalType::Geometry,
        ] {
            assert_eq!(InternalType::parse(&ty.sql_name()), Some(ty));
        }
    }

    #[test]
    fn test_resolve_requested_type() {
        assert_eq!(resolve_requested_type("number").unwrap(), InternalType::Integer);
        assert_eq!(resolve_requested_type("String").unwrap(), InternalType::Varchar(None));
        assert_eq!(resolve_requested_type("text").unwrap(), InternalType::Text);
        assert_eq!(resolve_requested_type("real").unwrap(), InternalType::Real);

        let err = resolve_requested_type("textttt").unwrap_err();
        assert!(matches!(err, Error::InvalidType(name) if name == "textttt"));
    }

    #[test]
    fn test_public_parse_rejects_unknown() {
        assert_eq!("geometry".parse::<PublicType>().unwrap(), PublicType::Geometry);
        assert!(PublicType::parse("integer").is_err());
    }
}
