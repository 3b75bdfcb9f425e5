//! Clock abstraction for deterministic delivery timing.
//!
//! The delivery manager stamps events with wall-clock time, measures channel
//! durations with monotonic time and paces its retry sweeps through
//! [`Clock::sleep`]. Tests substitute [`TestClock`] to control all three.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of time for delivery bookkeeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant used for durations and deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock time used for event timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as nanoseconds since the Unix epoch.
    fn unix_nanos(&self) -> i64 {
        let now = self.now_utc();
        now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
    }
}

/// Production clock backed by the system clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for tests.
///
/// Monotonic and wall-clock time only move through [`TestClock::advance`] or
/// [`TestClock::set_utc`]. Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    utc_ns: Arc<AtomicI64>,
    base: Instant,
}

impl TestClock {
    /// Creates a clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            utc_ns: Arc::new(AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0))),
            base: Instant::now(),
        }
    }

    /// Moves both monotonic and wall-clock time forward.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(nanos, Ordering::AcqRel);
        self.utc_ns.fetch_add(i64::try_from(nanos).unwrap_or(i64::MAX), Ordering::AcqRel);
    }

    /// Sets wall-clock time, leaving monotonic time untouched.
    pub fn set_utc(&self, time: DateTime<Utc>) {
        self.utc_ns.store(time.timestamp_nanos_opt().unwrap_or(0), Ordering::Release);
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.utc_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }

    fn unix_nanos(&self) -> i64 {
        self.utc_ns.load(Ordering::Acquire)
    }
}
