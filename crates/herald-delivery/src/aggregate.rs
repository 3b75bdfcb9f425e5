//! Aggregation of per-channel results into one cycle outcome.

use std::collections::BTreeSet;

use herald_core::{Channel, DeliveryResult};

/// Aggregated outcome of one fan-out cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// True when every dispatched channel succeeded, including zero channels.
    pub success: bool,
    /// Error of the last failing result to complete.
    pub last_error: Option<String>,
    /// Channels that accepted the event.
    pub succeeded_channels: BTreeSet<Channel>,
    /// Channels that failed.
    pub failed_channels: BTreeSet<Channel>,
    /// Number of results aggregated.
    pub dispatched: usize,
}

impl CycleOutcome {
    /// Folds results given in completion order.
    pub fn from_results(results: &[DeliveryResult]) -> Self {
        let mut outcome = Self { success: true, dispatched: results.len(), ..Self::default() };

        for result in results {
            if result.success {
                outcome.succeeded_channels.insert(result.channel);
            } else {
                outcome.success = false;
                outcome.failed_channels.insert(result.channel);
                outcome.last_error = Some(
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("{} delivery failed", result.channel)),
                );
            }
        }

        outcome
    }

    /// Number of succeeded channels.
    pub fn success_count(&self) -> usize {
        self.succeeded_channels.len()
    }

    /// Number of failed channels.
    pub fn failure_count(&self) -> usize {
        self.failed_channels.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn ok(channel: Channel) -> DeliveryResult {
        DeliveryResult::succeeded(channel, Utc::now(), Duration::from_millis(5))
    }

    fn failed(channel: Channel, error: &str) -> DeliveryResult {
        DeliveryResult::failed(channel, Utc::now(), Duration::from_millis(5), error)
    }

    #[test]
    fn zero_channels_is_success() {
        let outcome = CycleOutcome::from_results(&[]);
        assert!(outcome.success);
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(outcome.last_error, None);
    }

    #[test]
    fn one_failure_fails_the_cycle() {
        let outcome = CycleOutcome::from_results(&[
            ok(Channel::UserWebhook),
            failed(Channel::Broker, "broker unavailable"),
        ]);

        assert!(!outcome.success);
        assert_eq!(outcome.last_error.as_deref(), Some("broker unavailable"));
        assert_eq!(outcome.succeeded_channels, BTreeSet::from([Channel::UserWebhook]));
        assert_eq!(outcome.failure_count(), 1);
    }

    #[test]
    fn last_completed_failure_wins() {
        let outcome = CycleOutcome::from_results(&[
            failed(Channel::GlobalWebhook, "first"),
            ok(Channel::UserWebhook),
            failed(Channel::Broker, "second"),
        ]);

        assert_eq!(outcome.last_error.as_deref(), Some("second"));
        assert_eq!(outcome.success_count(), 1);
    }
}
