//! Table-driven import of a [`TableSnapshot`].
//!
//! Every registered entity type goes through the same routine:
//! 1. prepare records and look up existing `(local id, owner)` matches
//! 2. classify each record (insert / skip / update)
//! 3. rewrite foreign keys, insert new rows in batches, overwrite matched rows
//! 4. publish the type's identity mappings and run the deferred reference pass
//!
//! Each entity type runs in its own savepoint. If any step fails, the
//! savepoint is rolled back, the type is reported with `errors = 1`, and the
//! next type is processed.

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction};
use serde_json::Value;
use tracing::{info, warn};

use super::conflict::{self, Disposition};
use super::identity;
use super::record::{self, PendingRecord};
use super::writer::{Row, mint_id};
use super::{ImportContext, ImportOutcome, ImportStrategy};
use crate::db::registry::{self, DEPENDENCY_ORDER, EntitySpec};
use crate::error::{error_code, failure_summary};
use crate::snapshot::TableSnapshot;

/// Generic, partial-failure tolerant import strategy.
pub struct TableDriven<'a> {
    snapshot: &'a TableSnapshot,
}

impl<'a> TableDriven<'a> {
    pub fn new(snapshot: &'a TableSnapshot) -> Self {
        Self { snapshot }
    }
}

impl ImportStrategy for TableDriven<'_> {
    fn name(&self) -> &'static str {
        "tables"
    }

    fn version(&self) -> u32 {
        self.snapshot.version
    }

    fn run(&self, tx: &mut Transaction<'_>, ctx: &mut ImportContext) -> Result<()> {
        for name in self.snapshot.data.keys() {
            if registry::entity(name).is_none() {
                ctx.warn(format!("Ignoring unknown entity type '{name}'"));
            }
        }

        for spec in DEPENDENCY_ORDER.iter().copied() {
            let rows = self.snapshot.rows(spec.name);
            if rows.is_empty() {
                continue;
            }
            info!(entity = spec.name, records = rows.len(), "Processing entity type");

            let savepoint = tx.savepoint()?;
            match import_entity(&savepoint, spec, rows, ctx) {
                Ok(outcome) => {
                    savepoint
                        .commit()
                        .with_context(|| format!("failed to release savepoint for {}", spec.name))?;
                    info!(
                        entity = spec.name,
                        added = outcome.added,
                        skipped = outcome.skipped,
                        updated = outcome.updated,
                        mapped = ctx.identities.len(spec.name),
                        "Completed entity type"
                    );
                    ctx.outcomes.insert(spec.name.to_string(), outcome);
                }
                Err(err) => {
                    drop(savepoint);
                    ctx.identities.discard(spec.name);
                    ctx.references.discard_from(spec.name);
                    let summary = failure_summary(&err);
                    warn!(
                        entity = spec.name,
                        code = ?error_code(&err),
                        error = %summary,
                        "Entity type failed; rolled back"
                    );
                    ctx.warnings.push(format!("{}: {summary}", spec.name));
                    ctx.outcomes
                        .insert(spec.name.to_string(), ImportOutcome::failed());
                }
            }
        }

        Ok(())
    }

    fn local_ids(&self) -> Vec<(&'static EntitySpec, Result<Vec<String>>)> {
        DEPENDENCY_ORDER
            .iter()
            .copied()
            .map(|spec| {
                let locals = prepare_all(spec, self.snapshot.rows(spec.name))
                    .map(|records| records.into_iter().map(|r| r.local_id).collect());
                (spec, locals)
            })
            .collect()
    }
}

fn prepare_all(spec: &'static EntitySpec, rows: &[Value]) -> Result<Vec<PendingRecord>> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| record::prepare(spec, index, row).map_err(Into::into))
        .collect()
}

/// Classify, write and map every record of one entity type.
fn import_entity(
    conn: &Connection,
    spec: &'static EntitySpec,
    rows: &[Value],
    ctx: &mut ImportContext,
) -> Result<ImportOutcome> {
    let records = prepare_all(spec, rows)?;
    let locals: Vec<&str> = records.iter().map(|r| r.local_id.as_str()).collect();
    let existing = identity::lookup_existing(conn, spec, &ctx.owner, &locals)?;
    let plan = conflict::plan(&locals, &existing, ctx.mode);

    let mut outcome = ImportOutcome::default();
    let mut inserts = Vec::new();
    let mut updates = Vec::new();

    for (record, entry) in records.iter().zip(&plan.entries) {
        let Some(disposition) = entry else {
            ctx.warn(format!(
                "{} '{}' (record #{}) appears more than once; keeping the first",
                spec.name, record.local_id, record.index
            ));
            outcome.skipped += 1;
            continue;
        };

        match disposition {
            Disposition::Skip { existing_id } => {
                ctx.identities
                    .record(spec.name, &record.local_id, existing_id);
                outcome.skipped += 1;
            }
            Disposition::Insert => {
                let id = mint_id();
                ctx.identities.record(spec.name, &record.local_id, &id);
                let mut values = record.values.clone();
                values.extend(ctx.references.rewrite(spec, record, &id, &ctx.identities));
                inserts.push(Row::new(id, Some(record.local_id.clone()), values));
            }
            Disposition::Update { existing_id } => {
                ctx.identities
                    .record(spec.name, &record.local_id, existing_id);
                let mut values = record.values.clone();
                values.extend(
                    ctx.references
                        .rewrite(spec, record, existing_id, &ctx.identities),
                );
                updates.push(Row::new(
                    existing_id.clone(),
                    Some(record.local_id.clone()),
                    values,
                ));
            }
        }
    }

    outcome.added = ctx
        .writer
        .insert_batch(conn, spec, &ctx.owner, &inserts)?;
    for row in &updates {
        ctx.writer.update_one(conn, spec, &row.id, &row.values)?;
        outcome.updated += 1;
    }

    ctx.identities.complete(spec.name);
    ctx.references
        .flush(conn, &mut ctx.writer, &ctx.identities, spec.name)?;

    Ok(outcome)
}
