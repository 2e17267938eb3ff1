//! Command line entry point.
//!
//! Run with: cargo run -- ingest --data-dir data/raw --user alice

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use patrimoine::metrics::{MetricValue, Scope, ScopeMetrics};
use patrimoine::models::FileStatus;
use patrimoine::store::{MetricCache, SqliteStore};
use patrimoine::{BatchSummary, IngestConfig, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "patrimoine", version, about = "Ingest investment platform statements and compute portfolio metrics.")]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a data folder, reconcile with stored records and refresh metrics
    Ingest {
        /// Folder holding the platform workbooks and a pea/ folder of PDFs
        #[arg(long)]
        data_dir: PathBuf,

        #[arg(long)]
        user: String,

        /// SQLite database; defaults to the user data directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// JSON configuration overriding the defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Reference date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        as_of: Option<String>,

        /// Print the batch summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the cached metrics of a user
    Metrics {
        #[arg(long)]
        user: String,

        #[arg(long)]
        db: Option<PathBuf>,

        /// `global` or a platform key (lpb, bienpreter, homunity, pretup, assurance_vie, pea)
        #[arg(long, default_value = "global")]
        scope: String,

        #[arg(long)]
        json: bool,
    },
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .ok_or_else(|| anyhow!("no data directory on this system, pass --db"))?
        .join("patrimoine");
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir.join("patrimoine.db"))
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore> {
    let path = match db {
        Some(p) => p,
        None => default_db_path()?,
    };
    log::info!("Using database {}", path.display());
    SqliteStore::open(&path)
}

fn parse_as_of(raw: Option<&str>) -> Result<NaiveDate> {
    match raw {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid --as-of {:?}", s)),
        None => Ok(Local::now().date_naive()),
    }
}

fn format_value(value: &MetricValue) -> String {
    match value {
        MetricValue::Value { value } => format!("{:.4}", value),
        MetricValue::NotComputed { reason } => format!("not computed ({})", reason),
        MetricValue::Undefined { reason } => format!("undefined ({})", reason),
        MetricValue::NoConvergence { iterations } => format!("no convergence after {} iterations", iterations),
    }
}

fn print_scope(scope: &ScopeMetrics) {
    println!("\n[{}]", scope.scope);
    for metric in &scope.metrics {
        println!("  {:<22} {}", metric.metric_type.as_str(), format_value(&metric.value));
    }
}

fn print_summary(summary: &BatchSummary) {
    println!("=== Batch for {} as of {} ===\n", summary.user, summary.as_of);
    for report in &summary.files {
        let status = match report.status {
            FileStatus::Success => "ok",
            FileStatus::Warning => "warning",
            FileStatus::Error => "error",
        };
        println!(
            "{:<8} {} ({} investments, {} flows, {} positions, {} balances, {} skipped)",
            status,
            report.file,
            report.counts.investments,
            report.counts.cashflows,
            report.counts.positions,
            report.counts.liquidity,
            report.counts.skipped
        );
        for issue in &report.issues {
            println!(
                "         {:?} {}: {}{}",
                issue.severity,
                issue.code,
                issue.message,
                issue.reference.as_deref().map(|r| format!(" [{}]", r)).unwrap_or_default()
            );
        }
    }

    let t = &summary.totals;
    println!(
        "\nFiles: {} ({} ok, {} with warnings, {} failed)",
        t.files, t.succeeded, t.warnings, t.errors
    );
    println!(
        "New records: {} investments, {} cash flows",
        summary.new_investments, summary.new_cash_flows
    );
    let q = &summary.quality;
    println!(
        "Quality: {} orphan flow(s), {} ambiguous link(s), {} estimated split(s), {} low-confidence flow(s), {} tax mismatch(es), {} rejected record(s)",
        q.orphan_flows,
        q.ambiguous_links,
        q.estimated_allocations,
        q.low_confidence_flows,
        q.tax_inconsistencies,
        q.rejected_records
    );
    for issue in &summary.reconcile_issues {
        println!("  {:?} {}: {}", issue.severity, issue.code, issue.message);
    }

    for scope in &summary.metrics {
        print_scope(scope);
    }
}

fn ingest(
    data_dir: &Path,
    user: &str,
    db: Option<PathBuf>,
    config: Option<PathBuf>,
    as_of: Option<String>,
    json: bool,
) -> Result<()> {
    let config = IngestConfig::load(config.as_deref())?;
    let as_of = parse_as_of(as_of.as_deref())?;
    let mut store = open_store(db)?;

    let summary = Pipeline::new(&config, as_of).run(data_dir, user, &mut store)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn show_metrics(user: &str, db: Option<PathBuf>, scope: &str, json: bool) -> Result<()> {
    let scope = Scope::from_key(scope).ok_or_else(|| anyhow!("unknown scope {:?}", scope))?;
    let store = open_store(db)?;
    let metrics = store.cached_metrics(user, scope)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else if metrics.is_empty() {
        println!("No cached metrics for {} [{}]", user, scope);
    } else {
        print_scope(&ScopeMetrics { scope, metrics });
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level)).init();

    match cli.command {
        Command::Ingest { data_dir, user, db, config, as_of, json } => {
            ingest(&data_dir, &user, db, config, as_of, json)
        }
        Command::Metrics { user, db, scope, json } => show_metrics(&user, db, &scope, json),
    }
}
