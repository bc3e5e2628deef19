//! Column naming and type guessing for imports without a declared schema.
//!
//! Types are guessed from a sample of each column, picking the most specific
//! type every non-empty sampled value fits:
//!
//! ```text
//!   integer  ⊂  float (double precision)  ⊂  varchar
//! ```
//!
//! Anything ambiguous is a varchar: numbers with leading zeros (zip codes,
//! phone numbers), booleans, mixed columns, and columns with no values.

use crate::ddl::sanitize_identifier;
use crate::type_map::InternalType;
use crate::types::{is_reserved_column, Value};

/// Storage-safe column names for a header row. Unnamed, duplicate and
/// reserved headers become `unknown_name_1`, `unknown_name_2`, ...
pub fn column_names(headers: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(headers.len());
    let mut unknown = 0;
    for header in headers {
        let name = sanitize_identifier(header);
        if name.is_empty() || is_reserved_column(&name) || names.contains(&name) {
            let fallback = loop {
                unknown += 1;
                let candidate = format!("unknown_name_{unknown}");
                if !names.contains(&candidate) && !headers.iter().any(|h| h == &candidate) {
                    break candidate;
                }
            };
            names.push(fallback);
        } else {
            names.push(name);
        }
    }
    names
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Guess {
    Integer,
    Float,
    Varchar,
}

fn classify(value: &Value) -> Option<Guess> {
    match value {
        Value::Null => None,
        Value::Integer(_) => Some(Guess::Integer),
        Value::Float(_) => Some(Guess::Float),
        Value::Boolean(_) => Some(Guess::Varchar),
        Value::Text(raw) => classify_text(raw.trim()),
    }
}

fn classify_text(text: &str) -> Option<Guess> {
    if text.is_empty() {
        return None;
    }
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    if digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.") {
        return Some(Guess::Varchar);
    }
    if text.parse::<i64>().is_ok() {
        return Some(Guess::Integer);
    }
    let numeric_chars = digits.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'));
    if numeric_chars && text.parse::<f64>().is_ok_and(f64::is_finite) {
        return Some(Guess::Float);
    }
    Some(Guess::Varchar)
}

/// The storage type for a column given its sampled values.
pub fn guess_type<'a>(values: impl IntoIterator<Item = &'a Value>) -> InternalType {
    let guess = values
        .into_iter()
        .filter_map(classify)
        .max()
        .unwrap_or(Guess::Varchar);
    match guess {
        Guess::Integer => InternalType::Integer,
        Guess::Float => InternalType::DoublePrecision,
        Guess::Varchar => InternalType::Varchar(None),
    }
}
