//! # Value Codec
//!
//! Conversions between [`Value`] (what callers write and read) and what the
//! storage engine holds, plus the casting rules applied when a column is
//! retyped or written.
//!
//! ## Three Conversion Paths
//!
//! ```text
//!  caller Value ──coerce_for_write──► typed Value ──to_sql──► SQLite
//!                                                               │
//!  caller Value ◄──────────present───────────────────────────────┘
//!
//!  stored Value ──cast_value──► Value of the new type   (modify_column)
//! ```
//!
//! `cast_value` is strict: anything the target type can't represent is a cast
//! failure. `coerce_for_write` is more forgiving with caller input (empty
//! strings become null) and reports fractional numbers headed for an integer
//! column as [`Coerced::NeedsWidening`] instead of failing.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rusqlite::types::Value as SqlValue;

use crate::error::{Error, Result};
use crate::geometry;
use crate::type_map::InternalType;
use crate::types::Value;

// =============================================================================
// Formats
// =============================================================================

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp layouts accepted on input, tried in order.
const TIMESTAMP_INPUT_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

// =============================================================================
// Engine Encoding
// =============================================================================

/// Converts a typed value into its SQLite representation.
///
/// Booleans are stored as `0`/`1`; everything else maps one to one.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
    }
}

/// Reads a raw stored value without type information.
pub fn from_sql_untyped(raw: SqlValue) -> Value {
    match raw {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

/// Presents a stored value in the public shape of its column type.
///
/// SQLite's type affinity means the stored class doesn't always match the
/// declared type (a `double precision` column may hand back an integer), so
/// the declared type decides the shape.
pub fn present(raw: SqlValue, ty: InternalType) -> Value {
    match (from_sql_untyped(raw), ty) {
        (Value::Integer(i), InternalType::Boolean) => Value::Boolean(i != 0),
        (Value::Integer(i), InternalType::Real | InternalType::DoublePrecision) => {
            Value::Float(i as f64)
        }
        (Value::Float(f), t) if t.is_integer() => exact_integer(f).map_or(Value::Float(f), Value::Integer),
        (Value::Integer(i), t) if t.is_text() => Value::Text(i.to_string()),
        (Value::Float(f), t) if t.is_text() => Value::Text(f.to_string()),
        (v, _) => v,
    }
}

// =============================================================================
// Casting
// =============================================================================

/// `f` as an `i64` when it is whole and inside the `i64` range.
fn exact_integer(f: f64) -> Option<i64> {
    // 2^63 is exactly representable; every f64 below it fits.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (f.is_finite() && f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f)).then(|| f as i64)
}

/// Casts a stored value to `target`, as a retype does.
///
/// Returns `None` when the value can't be represented. Null always casts to
/// null.
pub fn cast_value(value: &Value, target: InternalType) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }

    match target {
        t if t.is_integer() => match value {
            Value::Integer(i) => Some(Value::Integer(*i)),
            Value::Float(f) => exact_integer(f.round()).map(Value::Integer),
            Value::Boolean(b) => Some(Value::Integer(i64::from(*b))),
            Value::Text(s) => s.trim().parse::<i64>().ok().map(Value::Integer),
            _ => None,
        },
        InternalType::Real | InternalType::DoublePrecision | InternalType::Numeric => {
            match value {
                Value::Integer(i) => Some(Value::Float(*i as f64)),
                Value::Float(f) => Some(Value::Float(*f)),
                Value::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Value::Float),
                _ => None,
            }
        }
        InternalType::Text => Some(Value::Text(value.to_text())),
        InternalType::Varchar(limit) | InternalType::Char(limit) => {
            let text = value.to_text();
            match limit {
                Some(n) if text.chars().count() > n as usize => None,
                _ => Some(Value::Text(text)),
            }
        }
        InternalType::Boolean => match value {
            Value::Boolean(b) => Some(Value::Boolean(*b)),
            Value::Integer(i) => Some(Value::Boolean(*i != 0)),
            Value::Text(s) => parse_bool(s).map(Value::Boolean),
            _ => None,
        },
        InternalType::Date => match value {
            Value::Text(s) => parse_timestamp(s).map(|ts| Value::Text(ts.format(DATE_FORMAT).to_string())),
            _ => None,
        },
        InternalType::Timestamp => match value {
            Value::Text(s) => {
                parse_timestamp(s).map(|ts| Value::Text(ts.format(TIMESTAMP_FORMAT).to_string()))
            }
            _ => None,
        },
        InternalType::Geometry => match value {
            Value::Text(s) => geometry::parse_ewkt(s).map(|p| Value::Text(p.to_ewkt())),
            _ => None,
        },
        // The integer guard above covers the remaining variants.
        _ => None,
    }
}

/// Outcome of coercing a caller-supplied value for a column.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    /// The value, converted to the column's type.
    Value(Value),
    /// A fractional or out-of-range number headed for an integer column; the
    /// column must be widened before this value can be written.
    NeedsWidening,
}

/// Coerces a value written by a caller into `target`.
///
/// Returns `None` when the value can't be stored in the column at all.
pub fn coerce_for_write(value: &Value, target: InternalType) -> Option<Coerced> {
    if let Value::Text(s) = value {
        if s.is_empty() && !target.is_text() {
            return Some(Coerced::Value(Value::Null));
        }
    }

    if target.is_integer() {
        let number = match value {
            Value::Float(f) => Some(*f),
            Value::Text(s) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    return Some(Coerced::Value(Value::Integer(i)));
                }
                s.trim().parse::<f64>().ok()
            }
            _ => None,
        };
        if let Some(f) = number.filter(|f| f.is_finite()) {
            return Some(match exact_integer(f) {
                Some(i) => Coerced::Value(Value::Integer(i)),
                None => Coerced::NeedsWidening,
            });
        }
    }

    cast_value(value, target).map(Coerced::Value)
}

/// Parses a `force_value` literal.
///
/// # Accepted Literals
///
/// `NULL`, `true`, `false`, integers, decimals, and single-quoted text with
/// `''` as the escaped quote. Nothing else is accepted: force values are
/// data, never SQL expressions.
pub fn parse_literal(literal: &str) -> Result<Value> {
    let trimmed = literal.trim();
    if trimmed.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return Ok(Value::Boolean(true));
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Ok(Value::Boolean(false));
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Ok(Value::Integer(i));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Ok(Value::Float(f));
        }
    }
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        let inner = &trimmed[1..trimmed.len() - 1];
        if !inner.replace("''", "").contains('\'') {
            return Ok(Value::Text(inner.replace("''", "'")));
        }
    }
    Err(Error::InvalidForceValue(literal.to_string()))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    for format in TIMESTAMP_INPUT_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.naive_utc());
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

// =============================================================================
// Time
// =============================================================================

/// Returns the current Unix time in milliseconds.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_text_to_integer() {
        let target = InternalType::Integer;
        assert_eq!(cast_value(&Value::from("1"), target), Some(Value::Integer(1)));
        assert_eq!(cast_value(&Value::from(" 42 "), target), Some(Value::Integer(42)));
        assert_eq!(cast_value(&Value::from("25.4"), target), None);
        assert_eq!(cast_value(&Value::from("abc"), target), None);
        assert_eq!(cast_value(&Value::Null, target), Some(Value::Null));
    }

    #[test]
    fn test_cast_numbers_to_text() {
        let target = InternalType::Varchar(None);
        assert_eq!(cast_value(&Value::Float(40.5), target), Some(Value::from("40.5")));
        assert_eq!(cast_value(&Value::Integer(3), target), Some(Value::from("3")));
        assert_eq!(
            cast_value(&Value::from("too long"), InternalType::Varchar(Some(3))),
            None
        );
    }

    #[test]
    fn test_cast_timestamps() {
        assert_eq!(
            cast_value(&Value::from("2010-10-13 10:46:32"), InternalType::Timestamp),
            Some(Value::from("2010-10-13 10:46:32"))
        );
        assert_eq!(
            cast_value(&Value::from("2010-10-13"), InternalType::Timestamp),
            Some(Value::from("2010-10-13 00:00:00"))
        );
        assert_eq!(
            cast_value(&Value::from("2010-10-13T10:46:32"), InternalType::Date),
            Some(Value::from("2010-10-13"))
        );
        assert_eq!(cast_value(&Value::from("yesterday"), InternalType::Date), None);
    }

    /// Fractional input for an integer column asks for widening instead of
    /// failing; whole numbers pass through.
    #[test]
    fn test_coerce_reports_widening() {
        let target = InternalType::Integer;
        assert_eq!(
            coerce_for_write(&Value::from("29"), target),
            Some(Coerced::Value(Value::Integer(29)))
        );
        assert_eq!(coerce_for_write(&Value::from("25.4"), target), Some(Coerced::NeedsWidening));
        assert_eq!(coerce_for_write(&Value::Float(2.5), target), Some(Coerced::NeedsWidening));
        assert_eq!(
            coerce_for_write(&Value::Float(3.0), target),
            Some(Coerced::Value(Value::Integer(3)))
        );
        assert_eq!(coerce_for_write(&Value::from("abc"), target), None);
    }

    /// Whole numbers outside the `i64` range can't be stored as integers.
    #[test]
    fn test_out_of_range_numbers_never_saturate() {
        let target = InternalType::Integer;
        assert_eq!(coerce_for_write(&Value::Float(1e20), target), Some(Coerced::NeedsWidening));
        assert_eq!(coerce_for_write(&Value::from("1e20"), target), Some(Coerced::NeedsWidening));
        assert_eq!(coerce_for_write(&Value::Float(-1e19), target), Some(Coerced::NeedsWidening));
        assert_eq!(
            coerce_for_write(&Value::Float(-9_223_372_036_854_775_808.0), target),
            Some(Coerced::Value(Value::Integer(i64::MIN)))
        );

        assert_eq!(cast_value(&Value::Float(1e20), target), None);
        assert_eq!(cast_value(&Value::Float(2.6), target), Some(Value::Integer(3)));
        assert_eq!(present(SqlValue::Real(1e20), target), Value::Float(1e20));
    }

    #[test]
    fn test_coerce_empty_string_is_null_for_non_text() {
        assert_eq!(
            coerce_for_write(&Value::from(""), InternalType::DoublePrecision),
            Some(Coerced::Value(Value::Null))
        );
        assert_eq!(
            coerce_for_write(&Value::from(""), InternalType::Text),
            Some(Coerced::Value(Value::from("")))
        );
    }

    #[test]
    fn test_present_uses_declared_type() {
        assert_eq!(present(SqlValue::Integer(1), InternalType::Boolean), Value::Boolean(true));
        assert_eq!(
            present(SqlValue::Integer(40), InternalType::DoublePrecision),
            Value::Float(40.0)
        );
        assert_eq!(present(SqlValue::Integer(211), InternalType::Integer), Value::Integer(211));
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(parse_literal("NULL").unwrap(), Value::Null);
        assert_eq!(parse_literal("0").unwrap(), Value::Integer(0));
        assert_eq!(parse_literal("1.5").unwrap(), Value::Float(1.5));
        assert_eq!(parse_literal("'it''s'").unwrap(), Value::from("it's"));
        assert!(matches!(
            parse_literal("now()"),
            Err(Error::InvalidForceValue(_))
        ));
        assert!(parse_literal("'a' || 'b'").is_err());
    }
}
