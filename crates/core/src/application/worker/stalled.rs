// Stalled-job checker - one leader per queue sweeps actives with lost locks

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ShutdownToken;
use crate::port::store::QueueStore;

/// Spawn the periodic stalled sweep. Leadership is decided per run by an
/// atomic probe inside the store; losing the probe skips the sweep.
pub(super) fn spawn_stalled_checker(
    store: Arc<dyn QueueStore>,
    max_stalled_count: u32,
    stalled_interval_ms: i64,
    mut shutdown: ShutdownToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(stalled_interval_ms.max(1) as u64);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(period) => {}
            }
            match store
                .check_stalled_jobs(max_stalled_count, stalled_interval_ms)
                .await
            {
                Ok(Some(sweep)) => {
                    if !sweep.stalled.is_empty() {
                        warn!(
                            count = %sweep.stalled.len(),
                            "Stalled jobs moved back to wait"
                        );
                    }
                    for job_id in &sweep.failed {
                        info!(
                            job_id = %job_id,
                            "Job failed after stalling more than allowable limit"
                        );
                    }
                }
                Ok(None) => {
                    debug!("Stalled check lease held elsewhere, skipping sweep");
                }
                Err(e) => {
                    error!(error = %e, "Stalled sweep failed");
                }
            }
        }
        debug!("Stalled checker stopped");
    })
}
