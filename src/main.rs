//! chat-import
//!
//! Command-line front end for importing exported chat snapshots into a
//! per-owner SQLite store.

use anyhow::{Result, bail};
use chat_data_import::cli::import::ImportArgs;
use chat_data_import::cli::{Cli, Command, StatsArgs};
use chat_data_import::config::Config;
use chat_data_import::db::Database;
use chat_data_import::db::import::{ImportOptions, ImportReport};
use chat_data_import::error::error_code;
use chat_data_import::snapshot::Payload;
use clap::Parser;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{Level, debug, info};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on --log option
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    match cli.log.as_str() {
        "0" | "off" => {
            // No logging
        }
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            // Log to file (append mode)
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    let mut config = Config::load_or_default(cli.config.as_deref().map(Path::new))?;
    if let Some(db_path) = &cli.database {
        config.database.path = db_path.into();
    }

    let result = match cli.command {
        Command::Import(args) => run_import(&config, args),
        Command::Stats(args) => run_stats(&config, args),
    };

    if let Err(err) = &result {
        if let Some(code) = error_code(err) {
            eprintln!("Error code: {:?}", code);
        }
    }
    result
}

fn resolve_owner(config: &Config, owner: Option<String>) -> Result<String> {
    match owner.or_else(|| config.import.owner.clone()) {
        Some(owner) if !owner.trim().is_empty() => Ok(owner),
        _ => bail!("No owner given. Pass --owner or set import.owner / CHAT_IMPORT_OWNER."),
    }
}

fn open_database(config: &Config) -> Result<Database> {
    config.ensure_db_dir()?;
    debug!(path = %config.database.path.display(), "Opening store");
    Database::open(&config.database.path)
}

fn run_import(config: &Config, args: ImportArgs) -> Result<()> {
    let owner = resolve_owner(config, args.owner.clone())?;
    let mode = args.conflict_mode(config.import.default_mode);

    debug!(
        file = %args.file.display(),
        gzip = args.is_gzipped(),
        "Loading snapshot"
    );
    let payload = Payload::from_file(&args.file, args.format.into())?;
    info!(
        kind = payload.kind(),
        version = payload.version(),
        mode = args.import_mode(config.import.default_mode),
        "Loaded snapshot"
    );

    let db = open_database(config)?;
    let options = ImportOptions::new(owner)
        .with_mode(mode)
        .with_batch_size(config.import.batch_size);

    if args.dry_run {
        let report = db.preview_import(&payload, &options)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        println!("Dry run results:");
        println!("  Format: {}", payload.kind());
        println!("  Mode: {}", options.mode);
        print_outcomes(&report, "would add", "would skip", "would update");
        return Ok(());
    }

    let report = db.import(&payload, &options)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Import complete:");
    println!("  Format: {}", payload.kind());
    println!("  Mode: {}", options.mode);
    print_outcomes(&report, "added", "skipped", "updated");
    if !report.write_batches.is_empty() {
        println!("  Insert batches:");
        for (entity, count) in &report.write_batches {
            println!("    {}: {}", entity, count);
        }
    }
    if report.rewrite_statements > 0 {
        println!("  Reference rewrites: {}", report.rewrite_statements);
    }
    if !report.unresolved.is_empty() {
        println!("  Unresolved references ({}):", report.unresolved.len());
        for gap in &report.unresolved {
            println!(
                "    {} {}.{} -> {} {}",
                gap.entity, gap.local_id, gap.column, gap.target, gap.target_local_id
            );
        }
    }
    if !report.warnings.is_empty() {
        println!("  Warnings:");
        for warning in &report.warnings {
            println!("    - {}", warning);
        }
    }

    let failed = report.failed_entities();
    if !failed.is_empty() {
        eprintln!("Entity types rolled back: {}", failed.join(", "));
    }

    Ok(())
}

fn print_outcomes(report: &ImportReport, added: &str, skipped: &str, updated: &str) {
    println!("  Entities:");
    for (entity, outcome) in &report.outcomes {
        let mut line = format!(
            "    {}: {} {}, {} {}, {} {}",
            entity, outcome.added, added, outcome.skipped, skipped, outcome.updated, updated
        );
        if outcome.errors > 0 {
            line.push_str(" (failed)");
        }
        println!("{}", line);
    }
    println!(
        "  Total: {} {}, {} {}, {} {}",
        report.total_added(),
        added,
        report.total_skipped(),
        skipped,
        report.total_updated(),
        updated
    );
}

fn run_stats(config: &Config, args: StatsArgs) -> Result<()> {
    let owner = resolve_owner(config, args.owner)?;
    let db = open_database(config)?;
    let counts = db.row_counts(&owner)?;

    println!("Rows for {}:", owner);
    for (entity, count) in &counts {
        println!("  {}: {}", entity, count);
    }
    Ok(())
}
