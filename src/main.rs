//! linewatch: command-line entry point.
//!
//! Loads configuration, initialises structured logging, and dispatches
//! to one of the subcommands. Exit codes: 0 success, 1 startup or run
//! failure, 2 unknown source or bad argument.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use linewatch::config::{self, AppConfig, DEFAULT_CONFIG_FILE};
use linewatch::consensus::{ConsensusConfig, ConsensusEngine};
use linewatch::fetch::{CircuitBreaker, FetchClient, ValidatorCache};
use linewatch::scheduler::{FileKillSwitch, Scheduler};
use linewatch::sources::{self, SourceRegistry};
use linewatch::storage::{self, QuoteStore, SnapshotFilter, SqliteStore, SweepJob};
use linewatch::types::{MarketKind, ScanPolicy};

const EXIT_FAILURE: u8 = 1;
const EXIT_BAD_ARG: u8 = 2;

#[derive(Parser)]
#[command(name = "linewatch", version, about = "Odds ingestion and EV/arbitrage scanning")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create tables and indexes.
    InitDb,
    /// Run one source once, now.
    RunSource { key: String },
    /// Run every enabled source on its cadence until Ctrl+C or the kill switch.
    Scheduler,
    /// Single-book EV scan. Prints hits without storing them.
    EvScan {
        #[arg(long, value_parser = parse_edge_arg)]
        edge: Option<f64>,
    },
    /// Cross-book EV and arbitrage scan. Stores hits unless --dry-run.
    EvScanXbook {
        #[arg(long, value_parser = parse_edge_arg)]
        edge: Option<f64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Most recent snapshots.
    Tail {
        #[arg(long)]
        book: Option<String>,
        #[arg(long)]
        event: Option<String>,
        #[arg(long)]
        market: Option<MarketKind>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Histogram of snapshot ages.
    OddsAge {
        #[arg(long)]
        book: Option<String>,
    },
    /// Run one source repeatedly to watch live updates.
    Pulse {
        #[arg(long)]
        book: String,
        #[arg(long, default_value = "30s", value_parser = parse_interval_arg)]
        every: Duration,
        #[arg(long = "for", default_value = "5m", value_parser = parse_duration_arg)]
        duration: Duration,
    },
    /// Print the effective configuration.
    Settings,
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    config::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_interval_arg(s: &str) -> Result<Duration, String> {
    let d = parse_duration_arg(s)?;
    if d.is_zero() {
        return Err("interval must be non-zero".to_string());
    }
    Ok(d)
}

fn parse_edge_arg(s: &str) -> Result<f64, String> {
    let edge: f64 = s.trim().parse().map_err(|_| format!("not a number: {s:?}"))?;
    config::check_edge_threshold(edge).map_err(|e| e.to_string())?;
    Ok(edge)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    init_logging();

    let cfg = match AppConfig::load_or_default(&cli.config).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(c) => c,
        Err(e) => {
            error!(error = format!("{e:#}"), "Invalid configuration");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match run(cli.command, cfg).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "Command failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(command: Command, cfg: AppConfig) -> Result<ExitCode> {
    match command {
        Command::InitDb => {
            open_store(&cfg).await?;
            println!("Database ready at {}", cfg.store.path);
            Ok(ExitCode::SUCCESS)
        }
        Command::RunSource { key } => run_source(&cfg, &key).await,
        Command::Scheduler => run_scheduler(&cfg).await,
        Command::EvScan { edge } => {
            let engine = consensus_engine(&cfg).await?;
            let threshold = edge.unwrap_or(cfg.consensus.edge_threshold);
            let report = engine.scan(ScanPolicy::SingleBook, threshold).await?;
            for hit in &report.hits {
                println!("{hit}");
            }
            println!(
                "{} hits in {} groups ({} skipped, {} malformed)",
                report.hits.len(),
                report.groups_scanned,
                report.groups_skipped,
                report.groups_failed
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::EvScanXbook { edge, dry_run } => {
            let engine = consensus_engine(&cfg).await?;
            let threshold = edge.unwrap_or(cfg.consensus.edge_threshold);
            let report = engine.scan(ScanPolicy::CrossBook, threshold).await?;
            for arb in &report.arbitrages {
                println!("{arb}");
            }
            for hit in &report.hits {
                println!("{hit}");
            }
            if dry_run {
                println!("Dry run: {} hits not stored", report.hits.len());
            } else {
                let stored = engine.store_hits(&report.hits).await;
                println!("Total EV hits stored: {stored}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Tail {
            book,
            event,
            market,
            limit,
        } => {
            let store = open_store(&cfg).await?;
            let filter = SnapshotFilter {
                bookmaker: book,
                event_key: event,
                market,
            };
            for snapshot in store.recent_snapshots(&filter, limit).await? {
                println!("{snapshot}  <{}>", snapshot.provenance.source_url);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::OddsAge { book } => {
            let store = open_store(&cfg).await?;
            let times = store.capture_times(book.as_deref()).await?;
            let histogram = storage::age_histogram(&times, chrono::Utc::now());
            println!("Odds age histogram ({} snapshots):", times.len());
            for (bucket, count) in histogram {
                println!("  {bucket:>7}  {count}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Pulse {
            book,
            every,
            duration,
        } => run_pulse(&cfg, &book, every, duration).await,
        Command::Settings => {
            let rendered =
                toml::to_string_pretty(&cfg).context("Failed to render configuration")?;
            println!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

async fn open_store(cfg: &AppConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::connect(&cfg.store.path)
        .await
        .with_context(|| format!("Store unreachable at {}", cfg.store.path))?;
    store.init().await.context("Failed to initialise schema")?;
    Ok(Arc::new(store))
}

fn fetch_client(cfg: &AppConfig) -> Result<Arc<FetchClient>> {
    let breaker = Arc::new(CircuitBreaker::new(cfg.circuit_config()));
    let validators = Arc::new(ValidatorCache::load(&cfg.http.validator_cache));
    let client = FetchClient::new(cfg.fetch_config(), breaker, validators)?;
    Ok(Arc::new(client))
}

async fn registry(cfg: &AppConfig) -> Result<(SourceRegistry, Arc<SqliteStore>)> {
    let store = open_store(cfg).await?;
    let client = fetch_client(cfg)?;
    let registry = sources::build_registry(cfg, client, store.clone());
    Ok((registry, store))
}

async fn consensus_engine(cfg: &AppConfig) -> Result<ConsensusEngine> {
    let store = open_store(cfg).await?;
    Ok(ConsensusEngine::new(store, ConsensusConfig::from(&cfg.consensus)))
}

/// Print why `key` is not runnable and return the bad-argument exit code.
fn unknown_source(cfg: &AppConfig, registry: &SourceRegistry, key: &str) -> ExitCode {
    match registry.skipped.iter().find(|(k, _)| k == key) {
        Some((_, reason)) => eprintln!("Source '{key}' is not runnable: {reason}"),
        None if cfg.source(key).is_some() => eprintln!("Source '{key}' is not runnable"),
        None => {
            let known: Vec<&str> = registry.keys().collect();
            eprintln!("Unknown source '{key}'. Try: {}", known.join(" | "));
        }
    }
    ExitCode::from(EXIT_BAD_ARG)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_source(cfg: &AppConfig, key: &str) -> Result<ExitCode> {
    let (registry, _store) = registry(cfg).await?;
    let Some(source) = registry.get(key) else {
        return Ok(unknown_source(cfg, &registry, key));
    };
    match source.job.run_with_stats().await {
        Ok(stats) => {
            println!(
                "[{key}] feeds ok={} unchanged={} failed={} | snapshots mapped={} invalid={} stored={} store_errors={}",
                stats.feeds_ok,
                stats.feeds_unchanged,
                stats.feeds_failed,
                stats.snapshots_mapped,
                stats.snapshots_invalid,
                stats.snapshots_stored,
                stats.store_errors
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(source = key, error = %e, "Run failed");
            Ok(ExitCode::from(EXIT_FAILURE))
        }
    }
}

async fn run_scheduler(cfg: &AppConfig) -> Result<ExitCode> {
    let (registry, store) = registry(cfg).await?;
    if registry.jobs.is_empty() {
        warn!("No runnable sources configured, only the TTL sweep will run");
    }

    let kill_switch = Arc::new(FileKillSwitch::new(&cfg.scheduler.kill_switch));
    let mut scheduler = Scheduler::new(
        cfg.backoff_policy(),
        kill_switch,
        cfg.scheduler.poll_interval,
    )
    .fire_on_start(true);

    for (key, source) in &registry.jobs {
        scheduler.register(key.clone(), source.cadence, source.job.clone())?;
    }
    let sweep = SweepJob::new(store, cfg.retention());
    scheduler.register("ttl-sweep", cfg.scheduler.sweep_cadence, Arc::new(sweep))?;

    info!(
        jobs = ?scheduler.job_ids(),
        kill_switch = %cfg.scheduler.kill_switch,
        "Scheduler starting. Press Ctrl+C to stop."
    );

    let handle = scheduler.start();
    handle
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("linewatch scheduler shut down cleanly.");
    Ok(ExitCode::SUCCESS)
}

async fn run_pulse(cfg: &AppConfig, key: &str, every: Duration, total: Duration) -> Result<ExitCode> {
    let (registry, _store) = registry(cfg).await?;
    let Some(source) = registry.get(key) else {
        return Ok(unknown_source(cfg, &registry, key));
    };

    let deadline = tokio::time::Instant::now() + total;
    let mut runs = 0usize;
    while tokio::time::Instant::now() < deadline {
        runs += 1;
        match source.job.run_with_stats().await {
            Ok(stats) => println!(
                "[pulse] run={runs} stored={} unchanged={}",
                stats.snapshots_stored, stats.feeds_unchanged
            ),
            Err(e) => println!("[pulse] run={runs} failed: {e}"),
        }
        tokio::time::sleep(every).await;
    }
    println!("[pulse] done runs={runs}");
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("linewatch=info"));

    let json_logging = std::env::var("LINEWATCH_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
