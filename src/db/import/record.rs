//! Conversion of dataset records into column values.
//!
//! Record keys may be camelCase or snake_case and are mapped onto the
//! entity's declared columns. Keys naming neither a payload column nor a
//! declared relation are dropped.

use heck::ToSnakeCase;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::db::registry::{EntitySpec, Relation};
use crate::error::ImportError;

/// Column name -> value for one row.
pub type Columns = BTreeMap<&'static str, SqlValue>;

/// A dataset record ready for classification and reference rewriting.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    /// Position in the input list.
    pub index: usize,
    pub local_id: String,
    /// Payload column values (relations excluded).
    pub values: Columns,
    /// Relation -> referenced local id, for non-null references only.
    pub references: Vec<(&'static Relation, String)>,
}

impl PendingRecord {
    pub fn reference(&self, column: &str) -> Option<&str> {
        self.references
            .iter()
            .find(|(rel, _)| rel.column == column)
            .map(|(_, local)| local.as_str())
    }
}

/// Keys that never map onto a writable column.
const RESERVED_KEYS: &[&str] = &["id", "client_id", "user_id"];

/// Prepare one table-snapshot record.
pub fn prepare(spec: &'static EntitySpec, index: usize, row: &Value) -> Result<PendingRecord, ImportError> {
    let obj = row
        .as_object()
        .ok_or_else(|| ImportError::malformed(spec.name, index, "record must be an object"))?;

    let (values, references) = prepare_fields(spec, index, obj)?;

    let explicit = ["clientId", "client_id", "id"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(scalar_string));

    let local_id = match (explicit, spec.derived_local_id) {
        (Some(id), _) => id,
        (None, Some(parts)) => {
            let mut segments = Vec::with_capacity(parts.len());
            for column in parts {
                let segment = references
                    .iter()
                    .find(|(rel, _)| rel.column == *column)
                    .map(|(_, local)| local.clone())
                    .ok_or_else(|| {
                        ImportError::malformed(
                            spec.name,
                            index,
                            format!("missing {column} needed to identify the record"),
                        )
                    })?;
                segments.push(segment);
            }
            segments.join(":")
        }
        (None, None) => {
            return Err(ImportError::malformed(spec.name, index, "missing id"));
        }
    };

    Ok(PendingRecord {
        index,
        local_id,
        values,
        references,
    })
}

/// Map record fields onto payload columns and relation references.
pub fn prepare_fields(
    spec: &'static EntitySpec,
    index: usize,
    fields: &Map<String, Value>,
) -> Result<(Columns, Vec<(&'static Relation, String)>), ImportError> {
    let mut values = Columns::new();
    let mut references = Vec::new();

    for (key, value) in fields {
        let column = key.to_snake_case();
        if RESERVED_KEYS.contains(&column.as_str()) {
            continue;
        }
        if !spec.accepts_column(&column) {
            debug!(entity = spec.name, field = %key, "Dropping unmapped field");
            continue;
        }

        if let Some(relation) = spec.relation(&column) {
            if value.is_null() {
                continue;
            }
            let local = scalar_string(value).ok_or_else(|| {
                ImportError::malformed(spec.name, index, format!("{key} must be an identifier"))
            })?;
            if !local.is_empty() {
                references.push((relation, local));
            }
            continue;
        }

        let Some(column) = spec.columns.iter().copied().find(|c| *c == column) else {
            continue;
        };

        let converted = if spec.is_timestamp(column) {
            timestamp_value(value)
        } else {
            Some(json_to_sql(value))
        };
        let converted = converted.ok_or_else(|| {
            ImportError::malformed(spec.name, index, format!("{key} is not a valid timestamp"))
        })?;
        values.insert(column, converted);
    }

    Ok((values, references))
}

/// Identifier-like scalar as a string.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Convert a JSON value to a column value. Nested values are stored as JSON text.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Epoch milliseconds from a number or an RFC 3339 string.
pub fn timestamp_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => Some(SqlValue::Null),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(SqlValue::Integer),
        Value::String(s) => parse_timestamp(s).map(SqlValue::Integer),
        _ => None,
    }
}

/// Parse an RFC 3339 timestamp (or a stringified epoch-ms number).
pub fn parse_timestamp(s: &str) -> Option<i64> {
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Strip characters the store cannot hold in text columns.
pub fn sanitize_text(s: &str) -> String {
    s.chars().filter(|c| *c != '\0').collect()
}

/// Whether a loosely-typed flag (bool, 0/1, "true") is set.
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty() && s != "false" && s != "0",
        _ => false,
    }
}
