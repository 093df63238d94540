//! Foreign-key rewriting.
//!
//! A reference is rewritten immediately when the referenced entity type has
//! completed in this run. References to the record's own type, or to a type
//! that has not completed yet, are written as NULL and queued; once the
//! referenced type completes, [`ReferenceRewriter::flush`] rewrites every
//! queued reference to it with one conditional update per column.
//! References that cannot be resolved stay NULL and are reported as
//! [`UnresolvedReference`]s.

use anyhow::{Result, anyhow};
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use super::identity::IdentityMap;
use super::record::{Columns, PendingRecord};
use super::writer::BatchWriter;
use crate::db::registry::{self, EntitySpec, Relation};

/// A reference whose target could not be found among this run's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedReference {
    /// Entity type of the referencing record.
    pub entity: String,
    /// Local id of the referencing record.
    pub local_id: String,
    pub column: String,
    /// Entity type the reference points at.
    pub target: String,
    /// Local id the reference points at.
    pub target_local_id: String,
}

/// A reference written as NULL, waiting for its target type to complete.
#[derive(Debug, Clone)]
struct DeferredRef {
    source: &'static EntitySpec,
    column: &'static str,
    row_id: String,
    local_id: String,
    target: &'static str,
    target_local_id: String,
}

/// Outcome of resolving one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    Deferred,
    Unresolved,
}

#[derive(Debug, Default)]
pub struct ReferenceRewriter {
    deferred: Vec<DeferredRef>,
    unresolved: Vec<UnresolvedReference>,
}

impl ReferenceRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column values for every relation of `spec`, for a record stored as `row_id`.
    ///
    /// Declared relations without a reference in the record are set to NULL.
    pub fn rewrite(
        &mut self,
        spec: &'static EntitySpec,
        record: &PendingRecord,
        row_id: &str,
        identities: &IdentityMap,
    ) -> Columns {
        let mut values = Columns::new();
        for relation in spec.relations {
            let value = match record.reference(relation.column) {
                Some(target_local) => match self.resolve(
                    spec,
                    relation,
                    &record.local_id,
                    row_id,
                    target_local,
                    identities,
                ) {
                    Resolution::Resolved(id) => SqlValue::Text(id),
                    Resolution::Deferred | Resolution::Unresolved => SqlValue::Null,
                },
                None => SqlValue::Null,
            };
            values.insert(relation.column, value);
        }
        values
    }

    /// Resolve one reference of the record `local_id` (stored as `row_id`).
    pub fn resolve(
        &mut self,
        spec: &'static EntitySpec,
        relation: &'static Relation,
        local_id: &str,
        row_id: &str,
        target_local: &str,
        identities: &IdentityMap,
    ) -> Resolution {
        let is_self = spec.self_relations().any(|r| r.column == relation.column);
        if is_self || !identities.is_completed(relation.references) {
            self.deferred.push(DeferredRef {
                source: spec,
                column: relation.column,
                row_id: row_id.to_string(),
                local_id: local_id.to_string(),
                target: relation.references,
                target_local_id: target_local.to_string(),
            });
            return Resolution::Deferred;
        }

        match identities.resolve(relation.references, target_local) {
            Some(id) => Resolution::Resolved(id.to_string()),
            None => {
                self.record_unresolved(
                    spec.name,
                    local_id,
                    relation.column,
                    relation.references,
                    target_local,
                );
                Resolution::Unresolved
            }
        }
    }

    /// Number of references waiting for their target type.
    pub fn pending(&self) -> usize {
        self.deferred.len()
    }

    pub fn unresolved(&self) -> &[UnresolvedReference] {
        &self.unresolved
    }

    /// Rewrite every queued reference pointing at `completed`, which must have
    /// just completed in `identities`. Returns the number of rows updated.
    ///
    /// The queue is only consumed once all updates succeeded.
    pub fn flush(
        &mut self,
        conn: &Connection,
        writer: &mut BatchWriter,
        identities: &IdentityMap,
        completed: &str,
    ) -> Result<usize> {
        let mut groups: BTreeMap<(&'static str, &'static str), Vec<(String, String)>> =
            BTreeMap::new();
        let mut missing = Vec::new();

        for deferred in self.deferred.iter().filter(|d| d.target == completed) {
            match identities.resolve(deferred.target, &deferred.target_local_id) {
                Some(id) => groups
                    .entry((deferred.source.name, deferred.column))
                    .or_default()
                    .push((deferred.row_id.clone(), id.to_string())),
                None => missing.push(deferred.clone()),
            }
        }

        let mut changed = 0;
        for ((source, column), updates) in &groups {
            let spec = registry::entity(source)
                .ok_or_else(|| anyhow!("unregistered entity type {source}"))?;
            changed += writer.rewrite_references(conn, spec, column, updates)?;
        }

        for d in missing {
            self.record_unresolved(
                d.source.name,
                &d.local_id,
                d.column,
                d.target,
                &d.target_local_id,
            );
        }
        self.deferred.retain(|d| d.target != completed);

        Ok(changed)
    }

    /// Drop queued references originating from an entity type whose rows were
    /// rolled back.
    pub fn discard_from(&mut self, source: &str) {
        self.deferred.retain(|d| d.source.name != source);
        self.unresolved.retain(|u| u.entity != source);
    }

    /// End of run: anything still queued points at a type that never
    /// completed and is reported as unresolved.
    pub fn finish(&mut self) -> Vec<UnresolvedReference> {
        for d in std::mem::take(&mut self.deferred) {
            self.record_unresolved(
                d.source.name,
                &d.local_id,
                d.column,
                d.target,
                &d.target_local_id,
            );
        }
        std::mem::take(&mut self.unresolved)
    }

    fn record_unresolved(
        &mut self,
        entity: &str,
        local_id: &str,
        column: &str,
        target: &str,
        target_local_id: &str,
    ) {
        warn!(
            entity,
            local_id,
            column,
            target,
            target_local_id,
            "Reference target not found; left empty"
        );
        self.unresolved.push(UnresolvedReference {
            entity: entity.to_string(),
            local_id: local_id.to_string(),
            column: column.to_string(),
            target: target.to_string(),
            target_local_id: target_local_id.to_string(),
        });
    }
}
