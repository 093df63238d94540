//! Import of exported snapshots into the store.
//!
//! An import merges one owner's exported dataset into the store inside a
//! single transaction. Entity types are processed in
//! [`DEPENDENCY_ORDER`](crate::db::registry::DEPENDENCY_ORDER), so every
//! foreign key can be translated from the dataset's local identifiers to the
//! store's authoritative identifiers using mappings built earlier in the
//! same run.
//!
//! Two strategies share the same building blocks:
//! - [`TableDriven`](tables::TableDriven) walks a table-keyed snapshot with one
//!   generic classify/insert/update routine. A failing entity type is rolled
//!   back to its savepoint and reported with `errors = 1`; later types still run.
//! - [`FineGrained`](legacy::FineGrained) imports the older client export with
//!   per-entity logic and upserts. Any failure aborts the whole import.
//!
//! Neither strategy retries. Re-running an import is safe: existing records
//! are matched on `(local id, owner)` and skipped or overwritten according to
//! the [`ConflictMode`].

pub mod conflict;
pub mod identity;
pub mod legacy;
pub mod record;
pub mod references;
pub mod tables;
pub mod writer;

pub use conflict::{ConflictMode, Disposition};
pub use references::UnresolvedReference;

use anyhow::{Result, bail};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::Database;
use super::registry::EntitySpec;
use crate::error::{ImportError, failure_summary};
use crate::snapshot::{LegacySnapshot, Payload, SUPPORTED_VERSION, TableSnapshot};
use identity::IdentityMap;
use references::ReferenceRewriter;
use writer::{BatchWriter, DEFAULT_BATCH_SIZE};

/// Options for controlling import behavior.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Identity that will own every imported record.
    pub owner: String,
    /// How records already present for the owner are handled.
    pub mode: ConflictMode,
    /// Rows per insert statement.
    pub batch_size: usize,
}

impl ImportOptions {
    /// Options for `owner` with the default mode and batch size.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            mode: ConflictMode::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the conflict mode (builder pattern).
    pub fn with_mode(mut self, mode: ConflictMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the insert batch size (builder pattern).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Per-entity tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub added: usize,
    pub skipped: usize,
    pub updated: usize,
    pub errors: usize,
}

impl ImportOutcome {
    /// Outcome of an entity type whose processing failed.
    pub fn failed() -> Self {
        Self {
            errors: 1,
            ..Self::default()
        }
    }
}

/// Result of an import (or of a preview, where nothing is written).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    /// Tallies keyed by entity type.
    pub outcomes: BTreeMap<String, ImportOutcome>,
    /// Insert statements issued per entity type.
    pub write_batches: BTreeMap<String, usize>,
    /// Conditional reference-rewrite statements issued.
    pub rewrite_statements: usize,
    /// References that could not be resolved and were left empty.
    pub unresolved: Vec<UnresolvedReference>,
    /// Any warnings encountered during import.
    pub warnings: Vec<String>,
}

impl ImportReport {
    pub fn outcome(&self, entity: &str) -> ImportOutcome {
        self.outcomes.get(entity).copied().unwrap_or_default()
    }

    /// Total number of records added.
    pub fn total_added(&self) -> usize {
        self.outcomes.values().map(|o| o.added).sum()
    }

    /// Total number of records skipped.
    pub fn total_skipped(&self) -> usize {
        self.outcomes.values().map(|o| o.skipped).sum()
    }

    /// Total number of records updated.
    pub fn total_updated(&self) -> usize {
        self.outcomes.values().map(|o| o.updated).sum()
    }

    /// Entity types whose processing failed.
    pub fn failed_entities(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.errors > 0)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// State of one import call, threaded through every step.
#[derive(Debug)]
pub struct ImportContext {
    pub owner: String,
    pub mode: ConflictMode,
    pub identities: IdentityMap,
    pub references: ReferenceRewriter,
    pub writer: BatchWriter,
    pub outcomes: BTreeMap<String, ImportOutcome>,
    pub warnings: Vec<String>,
}

impl ImportContext {
    pub fn new(options: &ImportOptions) -> Self {
        Self {
            owner: options.owner.clone(),
            mode: options.mode,
            identities: IdentityMap::new(),
            references: ReferenceRewriter::new(),
            writer: BatchWriter::new(options.batch_size),
            outcomes: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn into_report(mut self) -> ImportReport {
        let unresolved = self.references.finish();
        ImportReport {
            outcomes: self.outcomes,
            write_batches: self.writer.insert_batches().clone(),
            rewrite_statements: self.writer.rewrite_statements(),
            unresolved,
            warnings: self.warnings,
        }
    }
}

/// A way of importing one payload shape.
pub trait ImportStrategy {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Version declared by the payload.
    fn version(&self) -> u32;

    /// Run every step inside `tx`. Returning an error rolls back the whole import.
    fn run(&self, tx: &mut Transaction<'_>, ctx: &mut ImportContext) -> Result<()>;

    /// Local ids per entity type, in processing order, for previews.
    ///
    /// A type whose records cannot be read carries its error, so the preview
    /// can report it the way an import would and move on.
    fn local_ids(&self) -> Vec<(&'static EntitySpec, Result<Vec<String>>)>;
}

/// Reject payloads newer than this importer.
pub fn check_version(version: u32) -> Result<(), ImportError> {
    if version > SUPPORTED_VERSION {
        return Err(ImportError::IncompatibleVersion {
            found: version,
            supported: SUPPORTED_VERSION,
        });
    }
    Ok(())
}

impl Database {
    /// Import a payload using the strategy matching its shape.
    pub fn import(&self, payload: &Payload, options: &ImportOptions) -> Result<ImportReport> {
        match payload {
            Payload::Tables(snapshot) => self.import_tables(snapshot, options),
            Payload::Legacy(snapshot) => self.import_legacy(snapshot, options),
        }
    }

    /// Import a table-keyed snapshot (partial-failure tolerant).
    pub fn import_tables(
        &self,
        snapshot: &TableSnapshot,
        options: &ImportOptions,
    ) -> Result<ImportReport> {
        self.run_import(&tables::TableDriven::new(snapshot), options)
    }

    /// Import a legacy client export (all-or-nothing).
    pub fn import_legacy(
        &self,
        snapshot: &LegacySnapshot,
        options: &ImportOptions,
    ) -> Result<ImportReport> {
        self.run_import(&legacy::FineGrained::new(snapshot), options)
    }

    /// Run a strategy inside one transaction.
    ///
    /// Nothing is written if the version check fails or the strategy returns
    /// an error.
    pub fn run_import<S: ImportStrategy>(
        &self,
        strategy: &S,
        options: &ImportOptions,
    ) -> Result<ImportReport> {
        check_version(strategy.version())?;
        if options.owner.trim().is_empty() {
            bail!("an owner is required to import");
        }

        self.with_conn_mut(|conn| {
            let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut ctx = ImportContext::new(options);

            info!(
                strategy = strategy.name(),
                owner = %ctx.owner,
                mode = %ctx.mode,
                "Starting import"
            );
            strategy.run(&mut tx, &mut ctx)?;
            let report = ctx.into_report();
            tx.commit()?;

            info!(
                added = report.total_added(),
                skipped = report.total_skipped(),
                updated = report.total_updated(),
                unresolved = report.unresolved.len(),
                "Import committed"
            );
            Ok(report)
        })
    }

    /// Preview what an import would do without making any changes.
    pub fn preview_import(&self, payload: &Payload, options: &ImportOptions) -> Result<ImportReport> {
        check_version(payload.version())?;
        let entities = match payload {
            Payload::Tables(snapshot) => tables::TableDriven::new(snapshot).local_ids(),
            Payload::Legacy(snapshot) => legacy::FineGrained::new(snapshot).local_ids(),
        };
        self.with_conn(|conn| preview_entities(conn, &entities, options))
    }
}

/// Classify every record against the store without writing.
///
/// A type whose records are malformed is reported with `errors = 1`.
fn preview_entities(
    conn: &Connection,
    entities: &[(&'static EntitySpec, Result<Vec<String>>)],
    options: &ImportOptions,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    for (spec, locals) in entities {
        let locals = match locals {
            Ok(locals) => locals,
            Err(err) => {
                let summary = failure_summary(err);
                warn!(entity = spec.name, error = %summary, "Entity type would fail");
                report.warnings.push(format!("{}: {summary}", spec.name));
                report
                    .outcomes
                    .insert(spec.name.to_string(), ImportOutcome::failed());
                continue;
            }
        };
        if locals.is_empty() {
            continue;
        }
        let refs: Vec<&str> = locals.iter().map(String::as_str).collect();
        let existing = identity::lookup_existing(conn, spec, &options.owner, &refs)?;
        let plan = conflict::plan(&refs, &existing, options.mode);
        report.outcomes.insert(
            spec.name.to_string(),
            ImportOutcome {
                added: plan.inserts(),
                skipped: plan.skips(),
                updated: plan.updates(),
                errors: 0,
            },
        );
    }
    Ok(report)
}
