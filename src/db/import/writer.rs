//! Chunked writes against the store.
//!
//! Inserts go out in multi-row statements of at most `batch_size` rows.
//! Reference rewrites go out as one `CASE`-based conditional update per
//! column, split only when the bound-parameter limit would be exceeded.

use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use std::collections::BTreeMap;
use tracing::debug;

use super::record::Columns;
use crate::db::registry::{CREATED_AT_COLUMN, EntitySpec, UPDATED_AT_COLUMN};
use crate::db::{now_ms, quote_ident};
use crate::error::ImportError;

use super::conflict::ConflictMode;

/// Default number of rows per insert statement.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Rewrites per conditional update (three bound parameters each).
const REWRITE_CHUNK: usize = 5000;

/// SQLite's default limit on bound parameters per statement.
const MAX_BOUND_PARAMS: usize = 32766;

/// A row ready to be written.
#[derive(Debug, Clone)]
pub struct Row {
    /// Authoritative id (minted for inserts, existing for updates).
    pub id: String,
    /// Dataset-local id, if the row has one.
    pub local_id: Option<String>,
    pub values: Columns,
}

impl Row {
    pub fn new(id: impl Into<String>, local_id: Option<String>, values: Columns) -> Self {
        Self {
            id: id.into(),
            local_id,
            values,
        }
    }
}

/// Mint a new authoritative identifier.
pub fn mint_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Executes inserts and updates and keeps statement tallies for the report.
#[derive(Debug)]
pub struct BatchWriter {
    batch_size: usize,
    insert_batches: BTreeMap<String, usize>,
    rewrite_statements: usize,
}

impl BatchWriter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            insert_batches: BTreeMap::new(),
            rewrite_statements: 0,
        }
    }

    /// Rows per insert statement for `spec`: the configured batch size,
    /// capped so one statement stays within the bound-parameter limit.
    pub fn rows_per_statement(&self, spec: &EntitySpec) -> usize {
        let per_row = 3 + spec.writable_columns().len();
        self.batch_size.min(MAX_BOUND_PARAMS / per_row).max(1)
    }

    /// Insert statements issued per entity type.
    pub fn insert_batches(&self) -> &BTreeMap<String, usize> {
        &self.insert_batches
    }

    pub fn rewrite_statements(&self) -> usize {
        self.rewrite_statements
    }

    /// Insert rows in chunks. Returns the number of rows written.
    pub fn insert_batch(
        &mut self,
        conn: &Connection,
        spec: &EntitySpec,
        owner: &str,
        rows: &[Row],
    ) -> Result<usize> {
        let columns = spec.writable_columns();
        let now = now_ms();
        let mut written = 0;

        for chunk in rows.chunks(self.rows_per_statement(spec)) {
            let (sql, params) = insert_statement(spec, &columns, owner, chunk, now);
            written += conn
                .execute(&sql, params_from_iter(params))
                .map_err(|e| ImportError::persistence(spec.name, e))?;
            *self.insert_batches.entry(spec.name.to_string()).or_default() += 1;
            debug!(entity = spec.name, rows = chunk.len(), "Inserted batch");
        }

        Ok(written)
    }

    /// Insert rows, resolving `(local id, owner)` conflicts in the statement.
    ///
    /// Under [`ConflictMode::SkipExisting`] a conflicting row is left as is;
    /// under [`ConflictMode::OverwriteExisting`] its payload columns are
    /// replaced and `updated_at` refreshed. Either way the row is returned, so
    /// the result maps every input local id to its authoritative id.
    pub fn upsert_batch(
        &mut self,
        conn: &Connection,
        spec: &EntitySpec,
        owner: &str,
        rows: &[Row],
        mode: ConflictMode,
    ) -> Result<Vec<(String, String)>> {
        let columns = spec.writable_columns();
        let now = now_ms();
        let local = quote_ident(spec.local_id_column());
        let on_conflict = match mode {
            ConflictMode::SkipExisting => format!("{local} = excluded.{local}"),
            ConflictMode::OverwriteExisting => columns
                .iter()
                .filter(|c| **c != CREATED_AT_COLUMN)
                .map(|c| {
                    if *c == UPDATED_AT_COLUMN {
                        format!("{} = {now}", quote_ident(c))
                    } else {
                        format!("{col} = excluded.{col}", col = quote_ident(c))
                    }
                })
                .collect::<Vec<_>>()
                .join(", "),
        };

        let mut mapped = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(self.rows_per_statement(spec)) {
            let (insert, params) = insert_statement(spec, &columns, owner, chunk, now);
            let sql = format!(
                "{insert} ON CONFLICT ({local}, {owner_col}) DO UPDATE SET {on_conflict} RETURNING {local}, {id}",
                owner_col = quote_ident(spec.owner_column()),
                id = quote_ident(spec.id_column()),
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| ImportError::persistence(spec.name, e))?;
            let returned = stmt
                .query_map(params_from_iter(params), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| ImportError::persistence(spec.name, e))?;
            for pair in returned {
                mapped.push(pair.map_err(|e| ImportError::persistence(spec.name, e))?);
            }
            *self.insert_batches.entry(spec.name.to_string()).or_default() += 1;
            debug!(entity = spec.name, rows = chunk.len(), "Upserted batch");
        }

        Ok(mapped)
    }

    /// Overwrite one stored row with the given values and refresh `updated_at`.
    ///
    /// Every writable column is set; columns absent from `values` become NULL,
    /// except `created_at`, which is kept unless a non-null value is supplied.
    pub fn update_one(
        &mut self,
        conn: &Connection,
        spec: &EntitySpec,
        id: &str,
        values: &Columns,
    ) -> Result<()> {
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for column in spec.writable_columns() {
            if column == CREATED_AT_COLUMN
                && matches!(values.get(column), None | Some(SqlValue::Null))
            {
                continue;
            }
            if column == UPDATED_AT_COLUMN {
                continue;
            }
            assignments.push(format!("{} = ?", quote_ident(column)));
            params.push(values.get(column).cloned().unwrap_or(SqlValue::Null));
        }
        assignments.push(format!("{} = ?", quote_ident(UPDATED_AT_COLUMN)));
        params.push(SqlValue::Integer(now_ms()));
        params.push(SqlValue::Text(id.to_string()));

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(spec.table),
            assignments.join(", "),
            quote_ident(spec.id_column()),
        );
        conn.execute(&sql, params_from_iter(params))
            .map_err(|e| ImportError::persistence(spec.name, e))?;
        Ok(())
    }

    /// Set `column` on many rows at once: each `(row id, value)` pair becomes
    /// a `WHEN` arm of a single conditional update.
    pub fn rewrite_references(
        &mut self,
        conn: &Connection,
        spec: &EntitySpec,
        column: &str,
        updates: &[(String, String)],
    ) -> Result<usize> {
        let id_col = quote_ident(spec.id_column());
        let col = quote_ident(column);
        let mut changed = 0;

        for chunk in updates.chunks(REWRITE_CHUNK) {
            let arms = vec!["WHEN ? THEN ?"; chunk.len()].join(" ");
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "UPDATE {table} SET {col} = CASE {id_col} {arms} ELSE {col} END WHERE {id_col} IN ({placeholders})",
                table = quote_ident(spec.table),
            );
            let params = chunk
                .iter()
                .flat_map(|(id, value)| [id.as_str(), value.as_str()])
                .chain(chunk.iter().map(|(id, _)| id.as_str()));
            changed += conn
                .execute(&sql, params_from_iter(params))
                .map_err(|e| ImportError::persistence(spec.name, e))?;
            self.rewrite_statements += 1;
            debug!(entity = spec.name, column, rows = chunk.len(), "Rewrote references");
        }

        Ok(changed)
    }
}

impl Default for BatchWriter {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

/// Build a multi-row `INSERT` for one chunk.
fn insert_statement(
    spec: &EntitySpec,
    columns: &[&'static str],
    owner: &str,
    chunk: &[Row],
    now: i64,
) -> (String, Vec<SqlValue>) {
    let header: Vec<String> = [spec.id_column(), spec.local_id_column(), spec.owner_column()]
        .into_iter()
        .chain(columns.iter().copied())
        .map(quote_ident)
        .collect();
    let tuple = format!("({})", vec!["?"; header.len()].join(", "));
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(spec.table),
        header.join(", "),
        vec![tuple.as_str(); chunk.len()].join(", "),
    );

    let mut params = Vec::with_capacity(header.len() * chunk.len());
    for row in chunk {
        params.push(SqlValue::Text(row.id.clone()));
        params.push(
            row.local_id
                .clone()
                .map_or(SqlValue::Null, SqlValue::Text),
        );
        params.push(SqlValue::Text(owner.to_string()));
        for column in columns {
            let value = match row.values.get(column) {
                Some(SqlValue::Null) | None
                    if *column == CREATED_AT_COLUMN || *column == UPDATED_AT_COLUMN =>
                {
                    SqlValue::Integer(now)
                }
                Some(value) => value.clone(),
                None => SqlValue::Null,
            };
            params.push(value);
        }
    }

    (sql, params)
}
