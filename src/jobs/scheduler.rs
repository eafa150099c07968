//! Periodic driver for the batch jobs

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RunOutcome, Synchronizer, Validator};
use crate::config::SchedulerConfig;
use crate::error::{Result, StatsError};

/// Spawn the loop that runs [`run_cycle`] every `interval_secs` until
/// `shutdown` is cancelled. An in-flight cycle observes the same token.
pub fn start_background_tasks(
    sync: Arc<Synchronizer>,
    validator: Arc<Validator>,
    config: &SchedulerConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = config.interval();
    let run_on_start = config.run_on_start;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !run_on_start {
            // first tick completes immediately
            ticker.tick().await;
        }

        info!(interval_secs = period.as_secs(), run_on_start, "Statistics scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Statistics scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if !run_cycle(&sync, &validator, &shutdown).await {
                        info!("Statistics cycle interrupted");
                    }
                }
            }
        }
    })
}

/// Run every batch job once, in dependency order: daily counters first, then
/// the folds that read the daily rollups, then plans, then validation.
///
/// Failures are logged and the next job still runs. Returns false if the
/// cycle stopped early because `cancel` fired.
pub async fn run_cycle(
    sync: &Synchronizer,
    validator: &Validator,
    cancel: &CancellationToken,
) -> bool {
    log_outcome("sync_daily", sync.sync_daily_statistics(cancel).await)
        && log_outcome("sync_accumulated", sync.sync_accumulated_statistics(cancel).await)
        && log_outcome("sync_plan", sync.sync_plan_statistics(cancel).await)
        && log_outcome("validate", validator.validate_consistency(cancel).await)
}

fn log_outcome<R: std::fmt::Debug>(job: &str, result: Result<RunOutcome<R>>) -> bool {
    match result {
        Ok(RunOutcome::Completed(report)) => {
            info!(job, ?report, "Job finished");
            true
        }
        Ok(RunOutcome::Locked) => {
            debug!(job, "Skipped, lock held");
            true
        }
        Err(StatsError::Interrupted { processed }) => {
            warn!(job, processed, "Job interrupted");
            false
        }
        Err(e) if e.is_cancellation() => false,
        Err(e) => {
            error!(job, error = %e, "Job failed");
            true
        }
    }
}
