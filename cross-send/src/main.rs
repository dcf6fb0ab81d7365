//! cross-send - Background daemon for the post distribution engine
//!
//! Runs the periodic components (scheduler, credential refresh, analytics
//! sampling) and a worker pool that consumes the work queue: dispatch,
//! refresh, and analytics units alike.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use libcrosspost::dispatch::DispatchCoordinator;
use libcrosspost::analytics::AnalyticsRefresher;
use libcrosspost::platforms::registry::AdapterRegistry;
use libcrosspost::queue::{SqliteQueue, WorkKind, WorkQueue};
use libcrosspost::refresh::CredentialRefreshMonitor;
use libcrosspost::scheduler::SchedulerTrigger;
use libcrosspost::{Config, Database};

/// Lease long enough to ride out an adapter timeout plus bookkeeping.
const WORK_LEASE_SECS: i64 = 300;

#[derive(Parser, Debug)]
#[command(name = "cross-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled post dispatch")]
#[command(long_about = "\
cross-send - Background daemon for the post distribution engine

DESCRIPTION:
    cross-send is a long-running daemon that dispatches scheduled posts to
    their destination platforms. It polls for due posts, fans each one out
    to its targets through the platform adapters, retries transient
    failures with exponential backoff, refreshes expiring credentials,
    and periodically re-samples engagement metrics.

USAGE:
    # Run in foreground (logs to stderr)
    cross-send

    # Run with custom poll interval
    cross-send --poll-interval 30

    # Process everything currently due, then exit
    cross-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight dispatches finish)

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml
    Override with CROSSPOST_CONFIG.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
")]
struct Cli {
    /// Scheduler poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Process due work once and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    libcrosspost::logging::init_from_env("info", cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };
    if let Some(interval) = cli.poll_interval {
        config.scheduler.poll_interval_secs = interval;
    }

    let db = Database::new(&config.database.path)
        .await
        .context("failed to open database")?;
    let registry = Arc::new(AdapterRegistry::with_defaults());
    let queue = Arc::new(SqliteQueue::new(db.clone()));

    info!("cross-send daemon starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let scheduler = Arc::new(SchedulerTrigger::new(
        db.clone(),
        queue.clone(),
        config.scheduler.clone(),
        config.dispatch.aggregation,
    ));
    let coordinator = Arc::new(DispatchCoordinator::new(
        db.clone(),
        registry.clone(),
        queue.clone(),
        config.clone(),
    ));
    let refresh = Arc::new(CredentialRefreshMonitor::new(
        db.clone(),
        registry.clone(),
        queue.clone(),
        config.clone(),
    ));
    let analytics = Arc::new(AnalyticsRefresher::new(
        db.clone(),
        registry.clone(),
        queue.clone(),
        config.clone(),
    ));

    if cli.once {
        run_once(&scheduler, &coordinator, &refresh, &analytics, &*queue).await?;
        info!("cross-send: processed due work once, exiting");
        return Ok(());
    }

    let scheduler_task = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };
    let refresh_task = {
        let refresh = refresh.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { refresh.run(shutdown).await })
    };
    let analytics_task = {
        let analytics = analytics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { analytics.run(shutdown).await })
    };

    run_worker_loop(
        coordinator,
        refresh.clone(),
        analytics.clone(),
        queue,
        config.dispatch.workers,
        shutdown.clone(),
    )
    .await;

    let _ = tokio::join!(scheduler_task, refresh_task, analytics_task);
    info!("cross-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("signal setup failed")?;

    let shutdown_clone = shutdown.clone();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown_clone.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

/// Consume the work queue with bounded concurrency until shutdown.
async fn run_worker_loop(
    coordinator: Arc<DispatchCoordinator>,
    refresh: Arc<CredentialRefreshMonitor>,
    analytics: Arc<AnalyticsRefresher>,
    queue: Arc<SqliteQueue>,
    workers: usize,
    shutdown: Arc<AtomicBool>,
) {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let now = chrono::Utc::now().timestamp();
        let units = match queue
            .lease_due(now, workers.max(1) as i64, WORK_LEASE_SECS)
            .await
        {
            Ok(units) => units,
            Err(e) => {
                error!("Failed to lease work: {}", e);
                sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        if units.is_empty() {
            sleep(Duration::from_secs(1)).await;
            continue;
        }

        for unit in units {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let coordinator = coordinator.clone();
            let refresh = refresh.clone();
            let analytics = analytics.clone();
            let queue = queue.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let unit_id = unit.id;

                let result = match unit.kind {
                    WorkKind::Dispatch => coordinator.handle(&unit).await,
                    WorkKind::Refresh => {
                        refresh.refresh_account(&unit.subject_id).await.map(|_| ())
                    }
                    WorkKind::Analytics => {
                        let now = chrono::Utc::now().timestamp();
                        analytics
                            .sample_target(&unit.subject_id, now)
                            .await
                            .map(|_| ())
                    }
                };

                match result {
                    Ok(()) => {
                        if let Err(e) = queue.ack(unit_id).await {
                            error!("Failed to ack unit {}: {}", unit_id, e);
                        }
                    }
                    Err(e) => {
                        // Leave the unit leased; it redelivers after expiry.
                        error!("Work unit {} failed: {}", unit_id, e);
                    }
                }
            });
        }
    }

    // Wait for in-flight work to finish.
    let _ = semaphore.acquire_many(workers.max(1) as u32).await;
    info!("worker loop stopped");
}

/// One-shot mode: run each component once and drain the queue.
async fn run_once(
    scheduler: &SchedulerTrigger,
    coordinator: &DispatchCoordinator,
    refresh: &CredentialRefreshMonitor,
    analytics: &AnalyticsRefresher,
    queue: &SqliteQueue,
) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp();

    let claimed = scheduler.tick(now).await?;
    info!("scheduler: claimed {} post(s)", claimed);

    let refresh_units = refresh.tick(now).await?;
    let analytics_units = analytics.tick(now).await?;
    info!(
        "enqueued {} refresh and {} analytics unit(s)",
        refresh_units, analytics_units
    );

    loop {
        let units = queue.lease_due(now, 64, WORK_LEASE_SECS).await?;
        if units.is_empty() {
            break;
        }
        for unit in units {
            let unit_id = unit.id;
            match unit.kind {
                WorkKind::Dispatch => coordinator.handle(&unit).await?,
                WorkKind::Refresh => {
                    refresh.refresh_account(&unit.subject_id).await?;
                }
                WorkKind::Analytics => {
                    analytics.sample_target(&unit.subject_id, now).await?;
                }
            }
            queue.ack(unit_id).await?;
        }
    }

    Ok(())
}
