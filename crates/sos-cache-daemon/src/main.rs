use std::sync::Arc;

use clap::{Parser, Subcommand};
use sos_cache::{Candidate, FileLock, MutualExclusion};
use sos_core::config::CacheConfig;
use sos_core::FixedDirectory;
use sos_scheduler::{CacheSet, JobReport, SchedulerConfig, SchedulerContext, SchedulerSlot};
use tokio::sync::mpsc;
use tracing::{info, warn};

mod source;

use source::JsonFileSource;

// ── CLI ─────────────────────────────────────────────────────────────

/// Keeps the SOS entity caches fresh.
#[derive(Parser, Debug)]
#[command(name = "sos-cache-daemon", version, about)]
struct Cli {
    /// Path to the TOML config file (default: ~/.sos/sos-cache.toml).
    #[arg(long, env = "SOS_CACHE_CONFIG")]
    config: Option<String>,

    /// Override `cache.refresh_on_startup`.
    #[arg(long)]
    refresh_on_startup: Option<bool>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the scheduler until Ctrl-C (default).
    Run,
    /// Show cache files, their staleness and the lock state.
    Status,
    /// Run one full refresh now and exit.
    Refresh,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sos_cache_daemon=info,sos_scheduler=info,sos_cache=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let mut config = CacheConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CacheConfig::default()
    });
    if let Some(refresh) = cli.refresh_on_startup {
        config.cache.refresh_on_startup = refresh;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status => status(&config),
        Command::Refresh => refresh(config).await,
    }
}

static SCHEDULER: SchedulerSlot = SchedulerSlot::new();

fn context(config: &CacheConfig) -> SchedulerContext {
    let source = JsonFileSource::new(&config.source.path);
    info!(path = %source.path().display(), "using JSON file source");
    SchedulerContext::new(
        Arc::new(source),
        Arc::new(FixedDirectory::new(&config.cache.base_dir)),
        SchedulerConfig::from(config),
    )
}

async fn run(config: CacheConfig) -> anyhow::Result<()> {
    let (reports_tx, mut reports_rx) = mpsc::channel::<JobReport>(64);
    let ctx = context(&config).with_reports(reports_tx);
    let scheduler = SCHEDULER.init(ctx, config.cache.refresh_on_startup);

    tokio::spawn(async move {
        while let Some(report) = reports_rx.recv().await {
            info!(
                job_id = %report.job_id,
                kind = %report.kind,
                status = %report.status,
                updated = ?report.updated,
                elapsed_ms = report.elapsed_ms,
                error = report.error.as_deref().unwrap_or(""),
                "cache job finished"
            );
        }
    });

    info!(
        base_dir = %config.cache.base_dir.display(),
        candidates = scheduler.candidates().len(),
        "sos cache daemon running"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    scheduler.shutdown().await;
    Ok(())
}

fn status(config: &CacheConfig) -> anyhow::Result<()> {
    let resolver = Arc::new(FixedDirectory::new(&config.cache.base_dir));
    let caches = CacheSet::open(resolver.as_ref(), config.staleness());

    println!("cache directory: {}", config.cache.base_dir.display());
    for candidate in caches.candidates() {
        let path = candidate.file_path();
        let state = if !path.exists() {
            "missing"
        } else if candidate.requires_update() {
            "stale"
        } else {
            "fresh"
        };
        println!("  {:<24} {:<7} {}", candidate.name(), state, path.display());
    }

    let lock = FileLock::new(resolver);
    let held = lock.is_held()?;
    println!("lock: {}", if held { "held" } else { "free" });
    Ok(())
}

async fn refresh(config: CacheConfig) -> anyhow::Result<()> {
    let scheduler = SCHEDULER.init(context(&config), false);
    let report = scheduler.refresh_now().await;
    scheduler.shutdown().await;
    let Some(report) = report else {
        anyhow::bail!("cache refresh abandoned by shutdown");
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.error.is_some() {
        anyhow::bail!("cache refresh {}", report.status);
    }
    Ok(())
}
