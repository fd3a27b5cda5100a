//! poold — the cloudpool daemon.
//!
//! Assembles the reconciliation stack for one pool:
//! - In-memory cloud driver (simulated provider)
//! - Retrying + caching pool fetchers, with an optional on-disk snapshot
//! - Resize planner
//! - Pool updater
//!
//! # Usage
//!
//! ```text
//! poold run --config pool.toml --desired-size 4 --initial-machines 2
//! poold check --config pool.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use cloudpool_core::{Clock, InMemoryDriver, LogAlertSink, PoolConfig, SystemClock};
use cloudpool_fetch::{CacheSettings, CachingFetcher, RetryingFetcher};
use cloudpool_planner::ResizePlanner;
use cloudpool_updater::PoolUpdater;

#[derive(Parser)]
#[command(name = "poold", about = "cloudpool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation loops until interrupted.
    Run {
        /// Path to the pool config file.
        #[arg(long)]
        config: PathBuf,

        /// Desired pool size. Derived from the pool if omitted.
        #[arg(long, allow_negative_numbers = true)]
        desired_size: Option<i64>,

        /// Machines already running in the simulated cloud at startup.
        #[arg(long, default_value = "0")]
        initial_machines: usize,
    },
    /// Validate a config file and print the resolved settings.
    Check {
        /// Path to the pool config file.
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,poold=debug,cloudpool=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            desired_size,
            initial_machines,
        } => run(&config, desired_size, initial_machines).await,
        Command::Check { config } => check(&config),
    }
}

fn load_config(path: &Path) -> anyhow::Result<PoolConfig> {
    let config = PoolConfig::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!("config ok: pool {:?}", config.name);
    println!(
        "  retries:              {} (delay {:?})",
        config.fetch.retries.max_retries,
        config.fetch.retries.retry_policy()?.delay
    );
    println!("  refresh interval:     {:?}", config.fetch.refresh_interval()?);
    println!("  reachability timeout: {:?}", config.fetch.reachability_timeout()?);
    println!("  victim selection:     {}", config.scale_in.victim_selection_policy);
    println!("  instance-hour margin: {:?}", config.scale_in.instance_hour_margin()?);
    println!("  update interval:      {:?}", config.update.update_interval()?);
    match &config.snapshot_path {
        Some(path) => println!("  snapshot:             {}", path.display()),
        None => println!("  snapshot:             (none)"),
    }
    Ok(())
}

async fn run(
    config_path: &Path,
    desired_size: Option<i64>,
    initial_machines: usize,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    info!(pool = %config.name, "cloudpool daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let alerts = Arc::new(LogAlertSink);

    // Simulated cloud.
    let driver = Arc::new(InMemoryDriver::with_clock(clock.clone()));
    if initial_machines > 0 {
        driver.seed_running(initial_machines);
        info!(machines = initial_machines, "simulated cloud seeded");
    }

    // Fetchers.
    let retrying = Arc::new(RetryingFetcher::new(
        driver.clone(),
        config.fetch.retries.retry_policy()?,
        clock.clone(),
    ));
    let mut settings = CacheSettings::new(
        config.fetch.refresh_interval()?,
        config.fetch.reachability_timeout()?,
    );
    if let Some(path) = &config.snapshot_path {
        settings = settings.with_snapshot_path(path);
    }
    let fetcher = Arc::new(CachingFetcher::new(
        retrying,
        settings,
        clock.clone(),
        alerts.clone(),
    ));
    fetcher.start();
    fetcher.await_first_fetch().await;
    info!("first pool fetch completed");

    // Planner and updater.
    let planner = ResizePlanner::new(
        config.scale_in.victim_selection_policy,
        config.scale_in.instance_hour_margin()?,
    );
    info!(policy = %planner.policy(), "resize planner initialized");

    let updater = Arc::new(PoolUpdater::new(
        driver.clone(),
        fetcher.clone(),
        planner,
        alerts,
        clock,
    ));
    if let Some(size) = desired_size {
        updater.set_desired_size(size)?;
    }
    let update_interval = config.update.update_interval()?;
    updater.start(update_interval);

    // ── Status reporting ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status_handle = tokio::spawn(report_status(
        updater.clone(),
        update_interval,
        shutdown_rx,
    ));

    // ── Wait for shutdown ──────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = status_handle.await;
    updater.close();
    fetcher.close();

    match updater.pool_size().await {
        Ok(size) => println!("{}", serde_json::to_string_pretty(&size)?),
        Err(e) => warn!(error = %e, "pool size unavailable at shutdown"),
    }

    info!("cloudpool daemon stopped");
    Ok(())
}

/// Log the pool size once per interval.
async fn report_status(
    updater: Arc<PoolUpdater>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match updater.pool_size().await {
                    Ok(size) => info!(
                        desired = size.desired_size,
                        allocated = size.allocated,
                        active = size.active,
                        "pool status"
                    ),
                    Err(e) => warn!(error = %e, "pool status unavailable"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
