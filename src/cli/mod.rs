//! CLI command definitions for chat-import
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

pub mod import;

use clap::{Args, Parser, Subcommand};
use import::ImportArgs;

/// Import exported chat snapshots into a per-owner store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import a snapshot file for one owner
    Import(ImportArgs),

    /// Show stored row counts per entity type
    Stats(StatsArgs),
}

/// Arguments for the stats subcommand
#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Owner whose rows are counted (defaults to config)
    #[arg(long)]
    pub owner: Option<String>,
}
