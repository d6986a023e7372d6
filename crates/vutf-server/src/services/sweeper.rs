//! Periodic maintenance for the execution core
//!
//! Expires pooled orchestrators past their TTL and closes store handles
//! nobody has used for a while.

use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};
use vutf_core::OrchestratorService;

/// Handle for the running sweep task
pub struct Sweeper {
    abort_handle: tokio::task::AbortHandle,
}

impl Sweeper {
    /// Spawn the sweep loop
    pub fn start(service: Arc<OrchestratorService>, every: Duration) -> Self {
        info!(interval_secs = every.as_secs(), "Starting sweeper");

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match service.sweep().await {
                    Ok(report) => debug!(
                        orchestrators_expired = report.orchestrators_expired,
                        handles_closed = report.handles_closed,
                        "Sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Sweep failed"),
                }
            }
        });

        Self {
            abort_handle: handle.abort_handle(),
        }
    }

    /// Stop the sweep loop
    pub fn stop(&self) {
        self.abort_handle.abort();
        info!("Stopped sweeper");
    }
}
