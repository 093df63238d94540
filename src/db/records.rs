//! Read access to imported records.

use super::Database;
use super::quote_ident;
use super::registry::{self, DEPENDENCY_ORDER, EntitySpec};
use crate::error::ImportError;
use anyhow::Result;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A stored record, keyed by column name.
#[derive(Debug, Clone, Serialize)]
pub struct StoredRecord {
    /// Authoritative identifier.
    pub id: String,
    pub fields: Map<String, Value>,
}

impl StoredRecord {
    pub fn text(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(Value::as_str)
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        self.fields.get(column).and_then(Value::as_i64)
    }
}

fn lookup(entity: &str) -> Result<&'static EntitySpec> {
    registry::entity(entity).ok_or_else(|| ImportError::UnknownEntity(entity.to_string()).into())
}

fn count_internal(conn: &Connection, spec: &EntitySpec, owner: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            quote_ident(spec.table),
            quote_ident(spec.owner_column())
        ),
        params![owner],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or_default())
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

impl Database {
    /// Number of rows of one entity type owned by `owner`.
    pub fn count_rows(&self, entity: &str, owner: &str) -> Result<usize> {
        let spec = lookup(entity)?;
        self.with_conn(|conn| count_internal(conn, spec, owner))
    }

    /// Row counts for every entity type, keyed by entity name.
    pub fn row_counts(&self, owner: &str) -> Result<BTreeMap<String, usize>> {
        self.with_conn(|conn| {
            let mut counts = BTreeMap::new();
            for spec in DEPENDENCY_ORDER {
                counts.insert(spec.name.to_string(), count_internal(conn, spec, owner)?);
            }
            Ok(counts)
        })
    }

    /// Fetch one record by its dataset-local identifier.
    pub fn fetch_record(
        &self,
        entity: &str,
        owner: &str,
        local_id: &str,
    ) -> Result<Option<StoredRecord>> {
        let spec = lookup(entity)?;
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT * FROM {} WHERE {} = ?1 AND {} = ?2",
                quote_ident(spec.table),
                quote_ident(spec.local_id_column()),
                quote_ident(spec.owner_column()),
            );
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

            let result = stmt.query_row(params![local_id, owner], |row| {
                let mut fields = Map::new();
                for (i, name) in names.iter().enumerate() {
                    fields.insert(name.clone(), to_json(row.get_ref(i)?));
                }
                Ok(fields)
            });

            match result {
                Ok(fields) => {
                    let id = fields
                        .get(spec.id_column())
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Ok(Some(StoredRecord { id, fields }))
                }
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}
