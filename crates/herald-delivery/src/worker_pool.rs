//! Bounded pool running fan-out cycles with structured concurrency.
//!
//! At most `max_in_flight` cycles run at once and at most `max_queued`
//! wait for a slot. A cycle offered to a full pool is deferred instead of
//! blocking the caller; the manager leaves the event pending and a later
//! sweep offers it again. Every spawned task is tracked so shutdown can wait
//! for in-flight work.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::error::{DeliveryError, Result};

/// Default number of concurrently running cycles.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Default number of cycles waiting for a slot.
pub const DEFAULT_MAX_QUEUED: usize = 1024;

/// Whether a cycle was accepted by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The cycle runs now or once a slot frees up.
    Accepted,
    /// The pool is full or shutting down; the cycle was dropped.
    Deferred,
}

/// Semaphore-bounded task pool for fan-out cycles.
#[derive(Debug)]
pub struct DispatchPool {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    max_queued: usize,
    outstanding: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl DispatchPool {
    /// Creates a pool whose tasks observe `cancellation_token`.
    pub fn new(
        max_in_flight: usize,
        max_queued: usize,
        cancellation_token: CancellationToken,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            max_queued,
            outstanding: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            cancellation_token,
        }
    }

    /// Offers a cycle to the pool without waiting.
    ///
    /// Cycles still queued when the pool is cancelled never run.
    pub fn try_spawn<F>(&self, task: F) -> Dispatch
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancellation_token.is_cancelled() {
            return Dispatch::Deferred;
        }

        let capacity = self.max_in_flight + self.max_queued;
        let reserved = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < capacity).then_some(current + 1)
            })
            .is_ok();
        if !reserved {
            debug!(
                outstanding = self.outstanding.load(Ordering::Acquire),
                capacity, "dispatch pool full, deferring cycle"
            );
            return Dispatch::Deferred;
        }

        let permits = self.permits.clone();
        let outstanding = self.outstanding.clone();
        let running = self.running.clone();
        let cancellation_token = self.cancellation_token.clone();

        self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                () = cancellation_token.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };

            if let Some(_permit) = permit {
                running.fetch_add(1, Ordering::AcqRel);
                task.await;
                running.fetch_sub(1, Ordering::AcqRel);
            }

            outstanding.fetch_sub(1, Ordering::AcqRel);
        });

        Dispatch::Accepted
    }

    /// Cycles currently running.
    pub fn in_flight(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Cycles waiting for a slot.
    pub fn queued(&self) -> usize {
        self.outstanding.load(Ordering::Acquire).saturating_sub(self.in_flight())
    }

    /// Waits for every tracked task to finish.
    ///
    /// Callers cancel the pool's token first so queued cycles are dropped and
    /// running cycles observe cancellation.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if tasks are still running
    /// after `timeout`.
    pub async fn shutdown_graceful(&self, timeout: Duration) -> Result<()> {
        info!(
            in_flight = self.in_flight(),
            queued = self.queued(),
            timeout_ms = timeout.as_millis() as u64,
            "waiting for in-flight delivery cycles"
        );

        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("dispatch pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_ms = timeout.as_millis() as u64,
                    remaining = self.tracker.len(),
                    "dispatch pool shutdown timed out"
                );
                Err(DeliveryError::ShutdownTimeout { timeout_ms: timeout.as_millis() as u64 })
            },
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        if !self.tracker.is_empty() && !self.cancellation_token.is_cancelled() {
            warn!(
                remaining = self.tracker.len(),
                "dispatch pool dropped with running cycles, cancelling them"
            );
            self.cancellation_token.cancel();
        }
    }
}
