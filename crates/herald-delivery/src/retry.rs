//! Retry policy for partially failed events.
//!
//! The scheduler asks the policy whether a pending event is due for another
//! fan-out cycle. Two strategies are supported:
//!
//! - [`BackoffStrategy::Fixed`]: an event is due once it is older than the
//!   retry interval. Every sweep after that re-dispatches it.
//! - [`BackoffStrategy::Exponential`]: after failed cycle `n` the next attempt
//!   is scheduled `min(interval * 2^(n-1), max_delay)` later, randomized by
//!   `±jitter_factor`.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::DeliveryEvent;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default number of fan-out cycles before an event fails.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry sweep interval.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Retry policy applied by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Fan-out cycles allowed before the event is marked failed.
    pub max_retries: u32,

    /// Sweep interval and base backoff delay.
    pub interval: Duration,

    /// How retry times are derived.
    pub strategy: BackoffStrategy,

    /// Upper bound for exponential delays.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to exponential delays.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            interval: DEFAULT_RETRY_INTERVAL,
            strategy: BackoffStrategy::Fixed,
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

/// Strategy for deciding when a pending event is retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Retry on every sweep once the event is older than the interval.
    #[default]
    Fixed,
    /// Delay doubles after each failed cycle, capped at `max_delay`.
    Exponential,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

/// Which channels a retry cycle re-dispatches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedeliveryMode {
    /// Every enabled channel, including ones that already succeeded.
    #[default]
    AllChannels,
    /// Only channels that have not yet accepted the event.
    FailedChannelsOnly,
}

impl fmt::Display for RedeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllChannels => write!(f, "all_channels"),
            Self::FailedChannelsOnly => write!(f, "failed_channels_only"),
        }
    }
}

impl FromStr for RedeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all_channels" | "all" => Ok(Self::AllChannels),
            "failed_channels_only" | "failed_only" => Ok(Self::FailedChannelsOnly),
            other => Err(format!("unknown redelivery mode '{other}'")),
        }
    }
}

impl RetryPolicy {
    /// Returns true while another cycle is allowed after `attempt_count`.
    pub fn can_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_retries
    }

    /// Returns true if a sweep at `now` should dispatch the event.
    pub fn is_due(&self, event: &DeliveryEvent, now: DateTime<Utc>) -> bool {
        if !self.can_retry(event.attempt_count) {
            return false;
        }

        match self.strategy {
            BackoffStrategy::Fixed => event.age(now) > self.interval,
            BackoffStrategy::Exponential => match event.next_attempt_at {
                Some(next) => now >= next,
                None => event.age(now) > self.interval,
            },
        }
    }

    /// Schedules the retry following failed cycle `attempt_count`.
    ///
    /// Returns `None` under the fixed strategy, which has no per-event
    /// schedule.
    pub fn next_attempt_at(
        &self,
        attempt_count: u32,
        failed_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self.strategy {
            BackoffStrategy::Fixed => None,
            BackoffStrategy::Exponential => {
                let delay = apply_jitter(self.backoff_delay(attempt_count), self.jitter_factor)
                    .min(self.max_delay);
                let delay = chrono::Duration::from_std(delay).ok()?;
                Some(failed_at + delay)
            },
        }
    }

    /// Un-jittered delay after failed cycle `attempt_count` (1-based).
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.interval,
            BackoffStrategy::Exponential => {
                let exponent = attempt_count.saturating_sub(1).min(20);
                self.interval.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };
        delay.min(self.max_delay)
    }
}

/// Randomizes `duration` by `±jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}
