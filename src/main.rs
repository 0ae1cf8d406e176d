mod catalog;
mod config;
mod error;
mod extract;
mod models;
mod normalize;
mod registry;
mod runner;
mod sink;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::catalog::ProductCatalog;
use crate::extract::http::HttpClient;
use crate::registry::{JobRegistry, JobSelection};
use crate::runner::{JobOutcome, RunConfig, RunReport, Runner};
use crate::sink::{open_store, read_snapshot, remote_timeout, sqlite, RemoteOutcome, RemoteSink, SinkRouter};

#[derive(Parser)]
#[command(name = "pricewatch", about = "Toilet-paper price tracker for Singapore storefronts")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scrape jobs and persist the batch
    Run {
        /// Job ids to run, or `all` (default: all)
        #[arg(long, num_args = 1..)]
        jobs: Vec<String>,
        /// Target table
        #[arg(long)]
        table: Option<String>,
        /// Always write the local JSON snapshot
        #[arg(long)]
        local_dump: bool,
        /// Never write to the remote store
        #[arg(long)]
        skip_remote: bool,
        /// Directory for local snapshots
        #[arg(long)]
        local_dir: Option<PathBuf>,
        /// Max jobs in flight
        #[arg(short = 'c', long)]
        concurrency: Option<usize>,
        /// Per-job timeout in seconds
        #[arg(long)]
        job_timeout: Option<u64>,
        /// Whole-run timeout in seconds
        #[arg(long)]
        run_timeout: Option<u64>,
        /// Map listings onto canonical product names
        #[arg(long)]
        normalize: bool,
        /// Hide the progress bar
        #[arg(short, long)]
        quiet: bool,
    },
    /// List registered jobs
    Jobs,
    /// Append a local run snapshot to the remote store
    Push {
        /// Snapshot file written by `run`
        snapshot: PathBuf,
        /// Target table (default: the snapshot's table)
        #[arg(long)]
        table: Option<String>,
    },
    /// Summarise a SQLite price store
    Stats {
        /// SQLite database file
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        table: Option<String>,
        /// Also show the most recent rows
        #[arg(short = 'n', long, default_value = "0")]
        recent: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!("Ignoring unreadable .env: {}", e);
        }
    }

    let t0 = Instant::now();
    let mut settings = config::load()?;

    let result = match cli.command {
        Commands::Run {
            jobs,
            table,
            local_dump,
            skip_remote,
            local_dir,
            concurrency,
            job_timeout,
            run_timeout,
            normalize,
            quiet,
        } => {
            if let Some(table) = table {
                settings.table = table;
            }
            if let Some(dir) = local_dir {
                settings.local_dir = dir;
            }
            if let Some(n) = concurrency {
                settings.runner.concurrency = n;
            }
            if let Some(secs) = job_timeout {
                settings.runner.job_timeout_secs = secs;
            }
            if let Some(secs) = run_timeout {
                settings.runner.run_timeout_secs = secs;
            }

            let catalog = ProductCatalog::builtin()?;
            let http = HttpClient::new(&settings.http)?;
            let registry = JobRegistry::builtin(&catalog, &http)?;
            // Unknown ids abort here, before anything is fetched
            let jobs = registry.build(&JobSelection::from_args(&jobs))?;

            let router = SinkRouter::from_settings(&settings, skip_remote, local_dump);
            let mut cfg = RunConfig::from_settings(&settings.runner);
            cfg.show_progress = !quiet;
            cfg.normalize = normalize;

            println!("Running {} jobs into '{}'...", jobs.len(), router.table());
            let report = Runner::new(cfg).run(jobs, &router).await;
            print_report(&report);

            if !report.batch.is_empty() && !report.sink.persisted() {
                bail!("batch of {} observations was not persisted", report.batch.len());
            }
            Ok(())
        }
        Commands::Jobs => {
            let catalog = ProductCatalog::builtin()?;
            let http = HttpClient::new(&settings.http)?;
            let registry = JobRegistry::builtin(&catalog, &http)?;

            println!("{:<26} | {:<11} | {:<12} | {:<10} | {:<36}", "Job", "Extractor", "Site", "Brand", "Product");
            println!("{}", "-".repeat(107));
            for (id, entry, extractor) in registry.describe() {
                println!(
                    "{:<26} | {:<11} | {:<12} | {:<10} | {:<36}",
                    id,
                    extractor,
                    truncate(&entry.site, 12),
                    truncate(&entry.brand, 10),
                    truncate(&entry.description, 36)
                );
            }
            let unbound: Vec<&str> = catalog
                .all()
                .map(|e| e.key.as_str())
                .filter(|key| !registry.describe().any(|(_, e, _)| e.key == *key))
                .collect();
            println!("\n{} jobs over {} catalog entries", registry.len(), catalog.len());
            if !unbound.is_empty() {
                println!("Catalog entries without a job: {}", unbound.join(", "));
            }
            Ok(())
        }
        Commands::Push { snapshot, table } => {
            let local = read_snapshot(&snapshot)?;
            if local.observations.is_empty() {
                println!("{} has no observations.", snapshot.display());
                return Ok(());
            }
            if local.observation_count != local.observations.len() {
                warn!(
                    declared = local.observation_count,
                    found = local.observations.len(),
                    "Snapshot count does not match its rows"
                );
            }
            println!(
                "{}: {} jobs, {} to {}",
                local.run_id,
                local.jobs.len(),
                local.started_at.format("%Y-%m-%d %H:%M:%S"),
                local.finished_at.format("%H:%M:%SZ")
            );
            let table = table.unwrap_or(local.table);
            let store = open_store(&settings.remote, remote_timeout(&settings.http))?;
            let sink = RemoteSink::new(store, &table)?;
            let rows = sink.write(&local.observations).await?;
            println!(
                "Pushed {} rows from {} -> {}",
                rows,
                snapshot.display(),
                sink.target()
            );
            Ok(())
        }
        Commands::Stats { db, table, recent } => {
            let table = table.unwrap_or(settings.table);
            let conn = sqlite::connect(&db)?;
            sqlite::init_schema(&conn, &table)
                .with_context(|| format!("{} is not a price store", db.display()))?;
            let rows = sqlite::stats(&conn, &table)?;
            if rows.is_empty() {
                println!("No rows in '{}'.", table);
                return Ok(());
            }
            println!("{:<16} | {:>7} | {:<32}", "Site", "Rows", "Latest");
            println!("{}", "-".repeat(60));
            for s in &rows {
                println!(
                    "{:<16} | {:>7} | {:<32}",
                    truncate(&s.site, 16),
                    s.rows,
                    s.latest.as_deref().unwrap_or("-")
                );
            }
            let total: i64 = rows.iter().map(|s| s.rows).sum();
            println!("\n{} rows across {} sites", total, rows.len());

            if recent > 0 {
                let records = sqlite::fetch_all(&conn, &table)?;
                println!("\n--- Latest {} ---", recent.min(records.len()));
                for r in records.iter().rev().take(recent) {
                    let o = &r.observation;
                    println!(
                        "{:>6} | {:<12} | {:<36} | {:>8} | {}",
                        r.id,
                        truncate(&o.site, 12),
                        truncate(&o.description, 36),
                        o.price.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".into()),
                        o.collected_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn print_report(report: &RunReport) {
    println!(
        "\n{} into '{}' ({} to {})",
        report.run_id,
        report.table,
        report.started_at.format("%H:%M:%S"),
        report.finished_at.format("%H:%M:%SZ")
    );
    println!(
        "{:<26} | {:<12} | {:<16} | {:>3} | {:>7}",
        "Job", "Site", "Outcome", "Try", "Time"
    );
    println!("{}", "-".repeat(76));
    for job in &report.jobs {
        let (outcome, detail) = match &job.outcome {
            JobOutcome::Success { observations } => (format!("ok ({})", observations), None),
            JobOutcome::Failed { kind, detail } => (kind.to_string(), Some(detail)),
        };
        println!(
            "{:<26} | {:<12} | {:<16} | {:>3} | {:>7}",
            truncate(&job.job_id, 26),
            truncate(&job.site, 12),
            outcome,
            job.attempts,
            format_duration(std::time::Duration::from_millis(job.elapsed_ms))
        );
        if let Some(detail) = detail {
            println!("    {}", truncate(detail, 100));
        }
    }

    println!(
        "\n{} ok, {} failed, {} observations",
        report.succeeded(),
        report.failed(),
        report.batch.len()
    );
    if let Some(stats) = report.normalization {
        println!("Normalized {} ({} unmatched)", stats.matched, stats.unmatched);
    }
    match &report.sink.remote {
        RemoteOutcome::Written { rows, target } => println!("Remote: {} rows -> {}", rows, target),
        RemoteOutcome::Skipped { reason } => println!("Remote: skipped ({})", reason),
        RemoteOutcome::Failed { error } => println!("Remote: FAILED ({})", error),
    }
    if let Some(path) = &report.sink.local_path {
        println!("Local:  {}", path.display());
    }
    if let Some(error) = &report.sink.local_error {
        println!("Local:  FAILED ({})", error);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_width() {
        assert_eq!(truncate("Kleenex", 10), "Kleenex");
        assert_eq!(truncate("Cold Storage Online", 10), "Cold St...");
        assert_eq!(truncate("Cold Storage Online", 10).chars().count(), 10);
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(std::time::Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(std::time::Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(std::time::Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn push_takes_a_snapshot_path() {
        let cli = Cli::parse_from(["pricewatch", "push", "data/raw/scrape_20250301T020000Z.json"]);
        match cli.command {
            Commands::Push { snapshot, table } => {
                assert_eq!(snapshot, PathBuf::from("data/raw/scrape_20250301T020000Z.json"));
                assert!(table.is_none());
            }
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from([
            "pricewatch", "run", "--jobs", "coldstorage-kleenex", "redmart-tempo",
            "--skip-remote", "--table", "tp_test",
        ]);
        match cli.command {
            Commands::Run { jobs, skip_remote, table, local_dump, .. } => {
                assert_eq!(jobs, vec!["coldstorage-kleenex", "redmart-tempo"]);
                assert!(skip_remote);
                assert!(!local_dump);
                assert_eq!(table.as_deref(), Some("tp_test"));
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.log_level, "info");
    }
}
