use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use comfy_table::Table;
use tracing_subscriber::EnvFilter;

use slotflow_core::pipeline::{run_import, ImportConfig, RunReport};
use slotflow_core::registry::SchemaRegistry;
use slotflow_drive::{DriveClient, DriveConfig};

/// Pull snapshot CSVs from the remote folder tree into Postgres.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Root folder id to scan.
    #[arg(long)]
    folder: String,

    /// Inclusive start of the candidate date range (YYYY-MM-DD).
    #[arg(long)]
    start: NaiveDate,

    /// Inclusive end of the candidate date range; defaults to today.
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Concurrent fetch workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Files per batch.
    #[arg(long, default_value_t = 50)]
    max_files_per_batch: usize,

    /// Batches to run this invocation; 0 runs them all.
    #[arg(long, default_value_t = 0)]
    max_batches: usize,

    /// Skip the bulk merge path and upsert row by row.
    #[arg(long)]
    safe_merge_only: bool,

    /// Scan, diff and plan without downloading or writing.
    #[arg(long)]
    dry_run: bool,

    /// Schema registry TOML overriding the built-in store table.
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Print the run report as JSON instead of a table.
    #[arg(long)]
    json: bool,

    /// Failures to show in the table output.
    #[arg(long, default_value_t = 10)]
    max_errors_shown: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let access_token =
        std::env::var("DRIVE_ACCESS_TOKEN").context("DRIVE_ACCESS_TOKEN must be set")?;

    let pool = slotflow_core::db::connect(&database_url).await?;
    let remote = DriveClient::new(DriveConfig {
        access_token,
        ..DriveConfig::default()
    })?;

    let registry = match &cli.registry {
        Some(path) => SchemaRegistry::from_toml_file(path)?,
        None => SchemaRegistry::builtin().clone(),
    };

    let mut config = ImportConfig::new(
        cli.folder.clone(),
        cli.start,
        cli.end.unwrap_or_else(|| Utc::now().date_naive()),
    );
    config.workers = cli.workers;
    config.max_files_per_batch = cli.max_files_per_batch;
    config.max_batches = cli.max_batches;
    config.safe_merge_only = cli.safe_merge_only;
    config.dry_run = cli.dry_run;

    let report = run_import(&pool, &remote, &registry, &config).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, cli.max_errors_shown);
    }

    Ok(())
}

fn print_report(report: &RunReport, max_errors: usize) {
    let mut summary = Table::new();
    summary.set_header(["metric", "value"]);
    summary.add_row(["scanned files", &report.scanned.to_string()]);
    summary.add_row(["in date range", &report.in_range.to_string()]);
    summary.add_row(["changed (delta)", &report.delta.to_string()]);
    summary.add_row(["batches run", &report.batches_run.to_string()]);
    summary.add_row(["batches pending", &report.batches_pending.to_string()]);
    summary.add_row(["files imported", &report.files_imported.to_string()]);
    summary.add_row(["rows merged", &report.rows_merged.to_string()]);
    summary.add_row(["skipped", &report.skipped.len().to_string()]);
    summary.add_row(["failed", &report.failed.len().to_string()]);
    println!("{summary}");

    if !report.skipped.is_empty() {
        let mut skipped = Table::new();
        skipped.set_header(["skipped file", "reason"]);
        for entry in &report.skipped {
            skipped.add_row([entry.path.as_str(), entry.reason.as_str()]);
        }
        println!("{skipped}");
    }

    let (failures, hidden) = report.failures_preview(max_errors);
    if !failures.is_empty() {
        let mut failed = Table::new();
        failed.set_header(["failed file", "error"]);
        for entry in failures {
            failed.add_row([entry.path.as_str(), entry.error.as_str()]);
        }
        println!("{failed}");
        if hidden > 0 {
            println!("... and {hidden} more failures (use --json for the full list)");
        }
    }

    if report.dry_run {
        println!("dry run: nothing was downloaded or written");
    } else if report.batches_pending > 0 {
        println!(
            "{} batch(es) left for the next invocation; re-run to resume",
            report.batches_pending
        );
    }
}
