//! Periodic sweep scheduler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use crate::types::SweepReport;
use crate::SweepError;

/// Interval between sweeps when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest interval the scheduler will tick at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Type alias for the sweep function run on every tick.
pub type SweepFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<SweepReport, SweepError>> + Send>>
        + Send
        + Sync,
>;

/// Counters published by a running scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub sweeps_started: u64,
    pub sweeps_succeeded: u64,
    pub sweeps_failed: u64,
    /// Lessons published across all committed sweeps.
    pub lessons_published: u64,
    /// Programs promoted across all committed sweeps.
    pub programs_published: u64,
    pub last_report: Option<SweepReport>,
    pub last_error: Option<String>,
}

/// Runs a sweep once at start and then once per interval.
///
/// Sweeps never overlap: a tick that fires while a sweep is still running is
/// skipped. A failed or panicking sweep is logged and counted, and the next
/// tick runs as usual.
pub struct SweepScheduler {
    interval: Duration,
    sweep: SweepFn,
}

impl SweepScheduler {
    pub fn new(interval: Duration, sweep: SweepFn) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            sweep,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the scheduler loop. The first sweep starts immediately.
    ///
    /// Dropping the returned handle without calling
    /// [`SchedulerHandle::stop`] also ends the loop after any in-flight sweep.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stats_tx, stats_rx) = watch::channel(SchedulerStats::default());
        let task = tokio::spawn(run_loop(self.interval, self.sweep, shutdown_rx, stats_tx));

        SchedulerHandle {
            shutdown_tx,
            stats_rx,
            task,
        }
    }
}

/// Handle to a running [`SweepScheduler`].
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    stats_rx: watch::Receiver<SchedulerStats>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Snapshot of the current counters.
    pub fn stats(&self) -> SchedulerStats {
        self.stats_rx.borrow().clone()
    }

    /// Receiver notified after every sweep.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStats> {
        self.stats_rx.clone()
    }

    /// Stop scheduling. An in-flight sweep runs to completion (commit or
    /// rollback) before this returns. Returns the final counters.
    pub async fn stop(self) -> SchedulerStats {
        let Self {
            shutdown_tx,
            stats_rx,
            task,
        } = self;

        let _ = shutdown_tx.send(true);
        if let Err(e) = task.await {
            error!(error = %e, "scheduler task failed");
        }

        stats_rx.borrow().clone()
    }
}

async fn run_loop(
    period: Duration,
    sweep: SweepFn,
    mut shutdown_rx: watch::Receiver<bool>,
    stats_tx: watch::Sender<SchedulerStats>,
) {
    info!(interval_secs = period.as_secs(), "scheduler starting");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("scheduler received shutdown signal");
                    break;
                }
            }
            _ = ticker.tick() => {
                run_once(&sweep, &stats_tx).await;
            }
        }
    }

    info!("scheduler shut down gracefully");
}

/// Run one sweep on its own task so a panic is contained as a failure.
async fn run_once(sweep: &SweepFn, stats_tx: &watch::Sender<SchedulerStats>) {
    stats_tx.send_modify(|stats| stats.sweeps_started += 1);

    let sweep = Arc::clone(sweep);
    let result = match tokio::spawn(async move { sweep().await }).await {
        Ok(result) => result,
        Err(e) => Err(SweepError::Panicked(e.to_string())),
    };

    match result {
        Ok(report) => {
            debug!(
                claimed = report.claimed,
                lessons_published = report.lessons_published,
                "sweep finished"
            );
            stats_tx.send_modify(|stats| {
                stats.sweeps_succeeded += 1;
                stats.lessons_published += report.lessons_published as u64;
                stats.programs_published += report.programs_published as u64;
                stats.last_report = Some(report);
                stats.last_error = None;
            });
        }
        Err(e) => {
            error!(error = %e, "publication sweep failed");
            stats_tx.send_modify(|stats| {
                stats.sweeps_failed += 1;
                stats.last_error = Some(e.to_string());
            });
        }
    }
}
