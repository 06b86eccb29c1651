//! Long-running publication worker.

use std::time::Duration;

use miette::Result;
use tracing::{info, warn};

use cms_publisher::{PublicationSweep, SweepScheduler};

use crate::DatabaseArgs;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub db: DatabaseArgs,
    /// Time between sweep starts.
    pub interval: Duration,
    /// Maximum lessons claimed per sweep.
    pub batch_limit: Option<u32>,
}

/// Run the worker until SIGINT or SIGTERM.
///
/// The first sweep starts as soon as the store is ready. On shutdown no new
/// sweep is started and an in-flight one finishes before this returns.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let database = crate::open_database(&config.db).await?;

    let sweep = PublicationSweep::new(database.publication_store())
        .with_batch_limit(config.batch_limit);
    let handle = SweepScheduler::new(config.interval, sweep.into_sweep_fn()).start();

    info!(
        backend = database.backend(),
        interval_secs = config.interval.as_secs(),
        batch_limit = ?config.batch_limit,
        "publication worker started"
    );

    wait_for_shutdown().await;
    info!("received shutdown signal");

    let stats = handle.stop().await;
    info!(
        sweeps = stats.sweeps_started,
        succeeded = stats.sweeps_succeeded,
        failed = stats.sweeps_failed,
        lessons_published = stats.lessons_published,
        programs_published = stats.programs_published,
        "publication worker stopped"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, waiting for ctrl-c only");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    tokio::signal::ctrl_c().await.ok();
}
