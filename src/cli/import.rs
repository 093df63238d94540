//! Import subcommand for chat-import CLI
//!
//! Imports an exported snapshot file into the store on behalf of one owner.

use clap::{Args, ValueEnum};
use std::path::PathBuf;

use crate::db::import::ConflictMode;
use crate::snapshot::PayloadFormat;

/// Conflict mode for records that already exist for the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Keep stored records unchanged
    #[value(alias = "skip-existing")]
    Skip,
    /// Overwrite stored records
    #[value(alias = "overwrite-existing", alias = "overwrite")]
    Override,
}

impl From<ModeArg> for ConflictMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Skip => ConflictMode::SkipExisting,
            ModeArg::Override => ConflictMode::OverwriteExisting,
        }
    }
}

/// Snapshot shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FormatArg {
    /// Detect from the file contents
    #[default]
    Auto,
    /// Older client export (sessions, topics, messages)
    Legacy,
    /// Table-keyed snapshot (`data` object)
    Tables,
}

impl From<FormatArg> for PayloadFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Auto => PayloadFormat::Auto,
            FormatArg::Legacy => PayloadFormat::Legacy,
            FormatArg::Tables => PayloadFormat::Tables,
        }
    }
}

/// Arguments for the import subcommand
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Path to the snapshot file (JSON or gzip-compressed JSON)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Owner of the imported records (defaults to config)
    #[arg(long)]
    pub owner: Option<String>,

    /// How to treat records the owner already has (defaults to config)
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Snapshot format
    #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
    pub format: FormatArg,

    /// Validate import without modifying database
    ///
    /// Parses the file, checks the snapshot version, and reports how many
    /// records would be added, skipped or updated per entity type.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl ImportArgs {
    /// Check if this is a gzipped file based on extension
    pub fn is_gzipped(&self) -> bool {
        self.file.extension().is_some_and(|ext| ext == "gz")
    }

    /// Resolve the conflict mode, falling back to `default`.
    pub fn conflict_mode(&self, default: ConflictMode) -> ConflictMode {
        self.mode.map(ConflictMode::from).unwrap_or(default)
    }

    /// Describe the import mode for logging
    pub fn import_mode(&self, default: ConflictMode) -> &'static str {
        if self.dry_run {
            return "dry-run";
        }
        match self.conflict_mode(default) {
            ConflictMode::SkipExisting => "skip-existing",
            ConflictMode::OverwriteExisting => "overwrite-existing",
        }
    }
}
