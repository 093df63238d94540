//! Per-run translation of dataset-local identifiers to store identifiers.
//!
//! Mappings are staged while an entity type is being processed and only
//! become resolvable once [`IdentityMap::complete`] is called for that type.
//! A type whose processing failed is [`discard`](IdentityMap::discard)ed, so
//! dependents never see a half-written mapping.

use anyhow::Result;
use rusqlite::{Connection, params_from_iter};
use std::collections::{HashMap, HashSet};

use crate::db::quote_ident;
use crate::db::registry::EntitySpec;
use crate::error::ImportError;

/// Bound on the `IN (...)` list of a single existence lookup.
const LOOKUP_CHUNK: usize = 500;

/// Local id -> authoritative id, per entity type. Lives for one import call.
#[derive(Debug, Default)]
pub struct IdentityMap {
    staged: HashMap<&'static str, HashMap<String, String>>,
    completed: HashMap<&'static str, HashMap<String, String>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a mapping for an entity type that is still being processed.
    pub fn record(&mut self, entity: &'static str, local_id: &str, id: &str) {
        self.staged
            .entry(entity)
            .or_default()
            .insert(local_id.to_string(), id.to_string());
    }

    /// Publish every staged mapping of an entity type.
    pub fn complete(&mut self, entity: &'static str) {
        let staged = self.staged.remove(entity).unwrap_or_default();
        self.completed.entry(entity).or_default().extend(staged);
    }

    /// Forget everything recorded for an entity type.
    pub fn discard(&mut self, entity: &str) {
        self.staged.remove(entity);
        self.completed.remove(entity);
    }

    pub fn is_completed(&self, entity: &str) -> bool {
        self.completed.contains_key(entity)
    }

    /// Resolve a local id of a completed entity type.
    pub fn resolve(&self, entity: &str, local_id: &str) -> Option<&str> {
        self.completed
            .get(entity)
            .and_then(|map| map.get(local_id))
            .map(String::as_str)
    }

    /// Number of published mappings for an entity type.
    pub fn len(&self, entity: &str) -> usize {
        self.completed.get(entity).map_or(0, HashMap::len)
    }
}

/// Find rows of `spec` owned by `owner` whose local id is in `local_ids`.
///
/// Returns local id -> authoritative id.
pub fn lookup_existing(
    conn: &Connection,
    spec: &EntitySpec,
    owner: &str,
    local_ids: &[&str],
) -> Result<HashMap<String, String>> {
    let mut found = HashMap::new();
    let unique: Vec<&str> = {
        let mut seen = HashSet::new();
        local_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    };

    for chunk in unique.chunks(LOOKUP_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT {local}, {id} FROM {table} WHERE {owner_col} = ? AND {local} IN ({placeholders})",
            local = quote_ident(spec.local_id_column()),
            id = quote_ident(spec.id_column()),
            table = quote_ident(spec.table),
            owner_col = quote_ident(spec.owner_column()),
        );
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| ImportError::persistence(spec.name, e))?;
        let rows = stmt
            .query_map(
                params_from_iter(std::iter::once(owner).chain(chunk.iter().copied())),
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(|e| ImportError::persistence(spec.name, e))?;
        for row in rows {
            let (local, id) = row.map_err(|e| ImportError::persistence(spec.name, e))?;
            found.insert(local, id);
        }
    }

    Ok(found)
}
