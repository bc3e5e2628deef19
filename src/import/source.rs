//! Import sources: a header row followed by records, consumed once, top to
//! bottom.
//!
//! - [`CsvSource`]: comma-separated text with a header line, read with the
//!   `csv` crate. Fields may be double-quoted (`""` escapes a quote) and
//!   quoted fields may span lines; a quote inside an unquoted field is kept
//!   literally. Short rows are padded with nulls. Whitespace inside fields is
//!   kept as is.
//! - [`JsonSource`]: an array of objects, or an object holding one such
//!   array. Headers are the object keys in order of first appearance; JSON
//!   scalars keep their type, nested values are stored as JSON text.

use std::collections::VecDeque;
use std::io::Read;

use crate::error::{Error, Result};
use crate::types::Value;

/// A stream of records sharing one header row.
pub trait ImportSource {
    fn headers(&self) -> &[String];

    /// The next record, with one value per header. `None` at the end.
    fn next_record(&mut self) -> Result<Option<Vec<Value>>>;
}

// =============================================================================
// CSV
// =============================================================================

pub struct CsvSource<R> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    record: csv::StringRecord,
}

impl<R: Read> CsvSource<R> {
    /// Reads the header line.
    ///
    /// # Errors
    ///
    /// `Error::Import` for an empty input or unreadable text.
    pub fn new(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect();
        if headers.is_empty() {
            return Err(Error::Import("the file is empty".into()));
        }
        Ok(Self { reader, headers, record: csv::StringRecord::new() })
    }

    fn line(&self) -> u64 {
        self.record.position().map_or(0, |p| p.line())
    }
}

impl<R: Read> ImportSource for CsvSource<R> {
    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn next_record(&mut self) -> Result<Option<Vec<Value>>> {
        loop {
            if !self.reader.read_record(&mut self.record).map_err(csv_error)? {
                return Ok(None);
            }
            // whitespace-only line
            if self.record.len() == 1 && self.record[0].trim().is_empty() {
                continue;
            }
            break;
        }
        if self.record.len() > self.headers.len() {
            return Err(Error::Import(format!(
                "line {}: {} fields, header has {}",
                self.line(),
                self.record.len(),
                self.headers.len()
            )));
        }
        let mut values: Vec<Value> =
            self.record.iter().map(|f| Value::Text(f.to_string())).collect();
        values.resize(self.headers.len(), Value::Null);
        Ok(Some(values))
    }
}

fn csv_error(error: csv::Error) -> Error {
    Error::Import(format!("malformed CSV: {error}"))
}

// =============================================================================
// JSON
// =============================================================================

pub struct JsonSource {
    headers: Vec<String>,
    records: VecDeque<Vec<Value>>,
}

impl JsonSource {
    /// Parses the whole document up front.
    ///
    /// # Errors
    ///
    /// `Error::Import` for malformed JSON, a document without an array of
    /// objects, or an array element that isn't an object.
    pub fn new(reader: impl Read) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_reader(reader)
            .map_err(|e| Error::Import(format!("malformed JSON: {e}")))?;

        let items = match document {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(map) => map
                .into_iter()
                .find_map(|(_, v)| match v {
                    serde_json::Value::Array(items) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| Error::Import("JSON object holds no array of records".into()))?,
            _ => return Err(Error::Import("JSON document is not an array of records".into())),
        };

        let mut objects = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match item {
                serde_json::Value::Object(map) => objects.push(map),
                _ => return Err(Error::Import(format!("record {}: not an object", i + 1))),
            }
        }

        let mut headers: Vec<String> = Vec::new();
        for object in &objects {
            for key in object.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
        }

        let records = objects
            .into_iter()
            .map(|mut object| {
                headers
                    .iter()
                    .map(|h| object.remove(h).map(json_value).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Ok(Self { headers, records })
    }
}

impl ImportSource for JsonSource {
    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn next_record(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(self.records.pop_front())
    }
}

fn json_value(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Float).unwrap_or_else(|| Value::Text(n.to_string())),
        },
        serde_json::Value::String(s) => Value::Text(s),
        nested => Value::Text(nested.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut dyn ImportSource) -> Vec<Vec<Value>> {
        let mut records = Vec::new();
        while let Some(record) = source.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_csv_quotes_and_multiline_fields() {
        let input = "name,notes,age\n\
                     \"Smith, J\",\"said \"\"hi\"\"\nthen left\",42\n\
                     \n\
                     plain, spaced ,\n";
        let mut source = CsvSource::new(input.as_bytes()).unwrap();
        assert_eq!(source.headers(), ["name", "notes", "age"]);

        let records = drain(&mut source);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0][0], Value::from("Smith, J"));
        assert_eq!(records[0][1], Value::from("said \"hi\"\nthen left"));
        assert_eq!(records[1], vec![Value::from("plain"), Value::from(" spaced "), Value::from("")]);
    }

    #[test]
    fn test_csv_short_rows_are_padded_and_long_rows_rejected() {
        let mut source = CsvSource::new("a,b,c\r\n1\r\n1,2,3,4\r\n".as_bytes()).unwrap();
        assert_eq!(
            source.next_record().unwrap().unwrap(),
            vec![Value::from("1"), Value::Null, Value::Null]
        );
        assert!(matches!(source.next_record(), Err(Error::Import(_))));
    }

    #[test]
    fn test_csv_stray_quote_in_unquoted_field() {
        let mut source = CsvSource::new("name,n\n5\" screen,1\nplain,2\n".as_bytes()).unwrap();
        let records = drain(&mut source);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], vec![Value::from("5\" screen"), Value::from("1")]);
        assert_eq!(records[1], vec![Value::from("plain"), Value::from("2")]);
    }

    #[test]
    fn test_csv_empty_input() {
        assert!(matches!(CsvSource::new("".as_bytes()), Err(Error::Import(_))));
    }

    #[test]
    fn test_json_array_and_wrapped_array() {
        let body = r#"[{"name":"a","n":1},{"n":2.5,"extra":{"k":true},"flag":false}]"#;
        let mut source = JsonSource::new(body.as_bytes()).unwrap();
        assert_eq!(source.headers(), ["name", "n", "extra", "flag"]);
        let records = drain(&mut source);
        assert_eq!(records[0], vec![Value::from("a"), Value::Integer(1), Value::Null, Value::Null]);
        assert_eq!(
            records[1],
            vec![Value::Null, Value::Float(2.5), Value::from(r#"{"k":true}"#), Value::Boolean(false)]
        );

        let wrapped = r#"{"count":1,"rows":[{"x":"y"}]}"#;
        let mut source = JsonSource::new(wrapped.as_bytes()).unwrap();
        assert_eq!(source.headers(), ["x"]);
        assert_eq!(drain(&mut source).len(), 1);
    }

    #[test]
    fn test_json_rejects_non_records() {
        assert!(matches!(JsonSource::new("[1,2]".as_bytes()), Err(Error::Import(_))));
        assert!(matches!(JsonSource::new("{\"a\":1}".as_bytes()), Err(Error::Import(_))));
        assert!(matches!(JsonSource::new("nope".as_bytes()), Err(Error::Import(_))));
    }
}
