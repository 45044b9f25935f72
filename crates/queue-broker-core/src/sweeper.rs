//! Background task that periodically sweeps expired leases and messages.

use crate::coordinator::QueueCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "sweeper_tests.rs"]
mod tests;

/// Run [`QueueCoordinator::sweep`] every `interval` until the coordinator
/// shuts down
///
/// # Examples
///
/// ```rust,ignore
/// let coordinator = Arc::new(QueueCoordinator::open(&config).await?);
/// let sweeper = spawn_sweeper(Arc::clone(&coordinator), config.sweeper.interval());
///
/// // ... serve requests ...
///
/// coordinator.shutdown();
/// sweeper.await?;
/// ```
pub fn spawn_sweeper(coordinator: Arc<QueueCoordinator>, interval: Duration) -> JoinHandle<()> {
    let mut shutdown = coordinator.subscribe_shutdown();

    tokio::spawn(async move {
        info!(interval_millis = interval.as_millis() as u64, "Starting sweeper");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let report = coordinator.sweep().await;
                    if report.failed > 0 {
                        warn!(
                            failed_queues = report.failed,
                            returned = report.returned,
                            purged = report.purged,
                            "Sweep completed with failures"
                        );
                    } else if report.returned > 0 || report.purged > 0 {
                        debug!(
                            returned = report.returned,
                            purged = report.purged,
                            "Sweep completed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Sweeper stopped");
    })
}
