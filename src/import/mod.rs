//! # Import Pipeline
//!
//! Builds a managed table from tabular data:
//!
//! ```text
//!   bytes ──► ImportSource (CSV / JSON)
//!                 │  headers + first `sample_rows` records
//!                 ▼
//!           declared schema, or guessed names and types
//!                 │
//!                 ▼
//!           create table ──► insert every record in source order
//! ```
//!
//! Everything happens in one transaction owned by the caller. Any failure
//! along the way surfaces as `Error::Import` and the rollback leaves no
//! table behind.

pub mod guess;
pub mod source;

use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use tracing::info;

use crate::catalog;
use crate::ddl::{detect_roles, parse_schema};
use crate::error::{Error, Result};
use crate::lifecycle::{self, NewTable};
use crate::rows::BulkInserter;
use crate::storage::StoredColumn;
use crate::types::{Attributes, ManagedTable, OwnerId, Value};

pub use source::{CsvSource, ImportSource, JsonSource};

/// Options of an import: the new table's name, declared schema, tags and
/// privacy.
pub type ImportOptions = NewTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFormat {
    Csv,
    Json,
}

impl ImportFormat {
    /// Detects the format from a file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "txt" => Some(Self::Csv),
            "json" | "geojson" => Some(Self::Json),
            _ => None,
        }
    }

    /// Detects the format from an HTTP `Content-Type`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
        if mime.ends_with("json") {
            Some(Self::Json)
        } else if mime == "text/csv" || mime == "application/csv" {
            Some(Self::Csv)
        } else {
            None
        }
    }

    /// Opens a source of this format over `reader`.
    pub fn open<'a>(self, reader: impl Read + 'a) -> Result<Box<dyn ImportSource + 'a>> {
        Ok(match self {
            Self::Csv => Box::new(CsvSource::new(reader)?),
            Self::Json => Box::new(JsonSource::new(reader)?),
        })
    }
}

/// Wraps any failure as an import failure.
pub fn import_error(error: Error) -> Error {
    match error {
        Error::Import(_) => error,
        other => Error::Import(other.to_string()),
    }
}

// =============================================================================
// Pipeline
// =============================================================================

fn declared_columns(spec: &str, fields: usize) -> Result<Vec<StoredColumn>> {
    let columns = parse_schema(spec)?;
    if columns.len() < fields {
        return Err(Error::Import(format!(
            "declared schema has {} columns, source has {fields} fields",
            columns.len()
        )));
    }
    Ok(columns)
}

fn guessed_columns(headers: &[String], sample: &VecDeque<Vec<Value>>) -> Vec<StoredColumn> {
    guess::column_names(headers)
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let ty = guess::guess_type(sample.iter().filter_map(|record| record.get(i)));
            StoredColumn::new(name, ty)
        })
        .collect()
}

/// Creates a table from `source` and fills it. Runs in the caller's
/// transaction; errors are not yet wrapped with [`import_error`].
pub fn run(
    conn: &Connection,
    owner: OwnerId,
    source: &mut dyn ImportSource,
    options: &ImportOptions,
    sample_rows: usize,
) -> Result<ManagedTable> {
    let headers = source.headers().to_vec();
    if headers.is_empty() {
        return Err(Error::Import("the source has no columns".into()));
    }

    let mut sample = VecDeque::new();
    while sample.len() < sample_rows {
        match source.next_record()? {
            Some(record) => sample.push_back(record),
            None => break,
        }
    }

    let columns = match options.schema.as_deref().map(str::trim) {
        Some(spec) if !spec.is_empty() => declared_columns(spec, headers.len())?,
        _ => guessed_columns(&headers, &sample),
    };
    let roles = detect_roles(&columns);
    let mut table = lifecycle::create_with_columns(conn, owner, options, &columns, &roles)?;

    let mut inserter = BulkInserter::new(conn, &table)?;
    let mut imported = 0u64;
    loop {
        let record = match sample.pop_front() {
            Some(record) => record,
            None => match source.next_record()? {
                Some(record) => record,
                None => break,
            },
        };
        let attributes: Attributes = columns
            .iter()
            .zip(record)
            .map(|(column, value)| (column.name.clone(), value))
            .collect();
        imported += 1;
        inserter
            .insert(&mut table, &attributes)
            .map_err(|e| Error::Import(format!("record {imported}: {e}")))?;
    }

    info!(
        table_id = table.id.as_raw(),
        rows = imported,
        columns = columns.len(),
        "import finished"
    );
    catalog::load_table(conn, table.id)
}

/// Downloads an import payload, detecting its format from the response's
/// content type or, failing that, the URL path.
pub fn fetch(url: &str, timeout: Duration) -> Result<(ImportFormat, Vec<u8>)> {
    let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
    let response = client.get(url).send()?.error_for_status()?;

    let format = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(ImportFormat::from_content_type)
        .or_else(|| ImportFormat::from_path(response.url().path()))
        .unwrap_or(ImportFormat::Csv);
    let body = response.bytes()?.to_vec();
    Ok((format, body))
}
