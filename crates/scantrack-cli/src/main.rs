use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scantrack_core::EntityKind;
use scantrack_import::{
    AggregationPolicy, ImportConfig, ImportInput, ImportPipeline, ImportRequest, ProgressFn,
    ProgressPhase,
};
use scantrack_parse::parse_input;
use scantrack_storage::FsDocumentStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scantrack")]
#[command(about = "Scan time-series import and aggregation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full import pipeline against a document store directory.
    Import {
        /// CSV export to import.
        #[arg(long)]
        file: PathBuf,
        /// Entity kind of the export: players or guilds.
        #[arg(long)]
        kind: EntityKind,
        /// Store directory; defaults to SCANTRACK_STORE_DIR or ./scantrack_store.
        #[arg(long)]
        store: Option<PathBuf>,
        /// Aggregation policy YAML; the built-in policy applies when omitted.
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Parse a CSV export and print row statistics without writing anything.
    Check {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        kind: EntityKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Import {
            file,
            kind,
            store,
            policy,
        } => run_import(file, kind, store, policy).await,
        Commands::Check { file, kind } => run_check(file, kind),
    }
}

async fn run_import(
    file: PathBuf,
    kind: EntityKind,
    store: Option<PathBuf>,
    policy: Option<PathBuf>,
) -> Result<()> {
    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;

    let mut config = ImportConfig::from_env();
    if let Some(store_dir) = store {
        config.store_dir = store_dir;
    }
    let store = Arc::new(FsDocumentStore::new(config.store_dir.clone()));

    let mut pipeline = ImportPipeline::new(store).with_config(config);
    if let Some(policy_path) = policy {
        pipeline = pipeline.with_policy(AggregationPolicy::from_yaml_path(&policy_path)?);
    }

    let progress: ProgressFn = Arc::new(|event| {
        if event.phase == ProgressPhase::Write {
            eprintln!(
                "  {:?}: {}/{} (created={} duplicate={} error={})",
                event.pass, event.current, event.total, event.created, event.duplicate, event.error
            );
        }
    });

    let report = pipeline
        .run(ImportRequest::new(kind, ImportInput::RawText(text)).with_progress(progress))
        .await?;

    println!(
        "import complete: run_id={} kind={} rows={}/{} scans created={} duplicate={} error={} latest written={} skipped={} history buckets={} rank indices={} in {}ms",
        report.run_id,
        report.kind,
        report.counts.rows_accepted,
        report.counts.rows_total,
        report.counts.scans_created,
        report.counts.scans_duplicate,
        report.counts.scans_error,
        report.counts.latest_written,
        report.counts.latest_skipped,
        report.counts.history_buckets,
        report.counts.rank_indices,
        report.duration_ms,
    );
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    for error in &report.errors {
        eprintln!("error: {error}");
    }
    Ok(())
}

fn run_check(file: PathBuf, kind: EntityKind) -> Result<()> {
    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let outcome = parse_input(kind, ImportInput::RawText(text))
        .with_context(|| format!("parsing {}", file.display()))?;
    println!(
        "parsed {}: rows={} accepted={} missing_identifier={} bad_timestamp={} missing_server={} headers={}",
        file.display(),
        outcome.stats.total_rows,
        outcome.stats.accepted,
        outcome.stats.missing_identifier,
        outcome.stats.bad_timestamp,
        outcome.stats.missing_server,
        outcome.headers.join(","),
    );
    Ok(())
}
