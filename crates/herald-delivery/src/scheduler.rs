//! Periodic retry sweeps.

use std::{sync::Arc, time::Duration};

use herald_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manager::DeliveryManager;

/// Background task re-dispatching due pending events every interval.
///
/// Runs until its cancellation token fires. A sweep already in progress
/// finishes first; no new sweep starts afterwards.
#[derive(Debug)]
pub struct RetryScheduler {
    manager: DeliveryManager,
    interval: Duration,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl RetryScheduler {
    /// Creates a scheduler for `manager`.
    pub fn new(
        manager: DeliveryManager,
        interval: Duration,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { manager, interval, clock, cancellation_token }
    }

    /// Sweeps until cancelled.
    pub async fn run(self) {
        info!(interval_ms = self.interval.as_millis() as u64, "retry scheduler started");
        let mut sweeps: u64 = 0;

        loop {
            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                () = self.clock.sleep(self.interval) => {
                    let dispatched = self.manager.sweep().await;
                    sweeps += 1;
                    if dispatched > 0 {
                        debug!(sweep = sweeps, dispatched, "retry sweep dispatched events");
                    }
                },
            }
        }

        info!(sweeps, "retry scheduler stopped");
    }
}
