//! Background time-partition maintenance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::PartitionManager;

/// Run `ensure_time_partitions()` every `interval` until `shutdown` flips to
/// `true` (or its sender is dropped).
///
/// The first pass runs immediately. A failed pass is logged and the loop keeps
/// going; the next tick retries.
pub fn spawn_maintenance<M>(
    manager: Arc<M>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    M: PartitionManager + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "partition maintenance started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match manager.ensure_time_partitions().await {
                        Ok(report) => debug!(
                            partitions_checked = report.partitions_checked,
                            events_archived = report.events_archived,
                            "partition maintenance pass finished"
                        ),
                        Err(e) => warn!(error = %e, "partition maintenance pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("partition maintenance stopped");
    })
}
