//! Configuration structures for routing and delivery behavior.

use crate::routing::DEFAULT_PARENT_RESOLUTION_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay before a retry grows with the number of failed attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Every retry waits `send_msg_retry_interval`.
    Fixed {
        /// Add up to one extra interval of random delay per retry.
        jitter: bool,
    },

    /// `interval + random(0, 2^retries * interval)`, capped at `max_retry_delay`.
    Exponential,
}

/// Configuration for the message router and its collaborators.
///
/// Durations are expressed in milliseconds when (de)serialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Base delay between delivery attempts of the same message.
    #[serde(with = "duration_ms")]
    pub send_msg_retry_interval: Duration,

    /// Upper bound for a single backoff delay.
    #[serde(with = "duration_ms")]
    pub max_retry_delay: Duration,

    /// Retry delay growth.
    pub backoff: BackoffStrategy,

    /// Maximum number of retries per message.
    /// None means retry until the TTL runs out.
    pub max_retry_count: Option<u32>,

    /// Number of delivery workers draining the queue.
    pub worker_count: usize,

    /// Maximum number of messages waiting for delivery.
    pub queue_capacity: usize,

    /// Round-trip TTL used when a caller does not specify one.
    #[serde(with = "duration_ms")]
    pub default_round_trip_ttl: Duration,

    /// Extra lifetime granted to a routing entry on top of its expiry.
    #[serde(with = "duration_ms")]
    pub routing_table_grace_period: Duration,

    /// Interval of the routing table purge task.
    /// Set to `Duration::ZERO` to disable periodic purging.
    #[serde(with = "duration_ms")]
    pub routing_table_cleanup_interval: Duration,

    /// How long `prepare_for_shutdown` waits for the queue to drain.
    #[serde(with = "duration_ms")]
    pub shutdown_drain_timeout: Duration,

    /// Deadline for one parent router lookup.
    #[serde(with = "duration_ms")]
    pub parent_resolution_timeout: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            send_msg_retry_interval: Duration::from_secs(3),
            max_retry_delay: Duration::from_secs(60),
            backoff: BackoffStrategy::Exponential,
            max_retry_count: None, // Retry until TTL by default
            worker_count: 4,
            queue_capacity: 10_000,
            default_round_trip_ttl: Duration::from_secs(60),
            routing_table_grace_period: Duration::from_secs(60),
            routing_table_cleanup_interval: Duration::from_secs(60),
            shutdown_drain_timeout: Duration::from_millis(1500),
            parent_resolution_timeout: DEFAULT_PARENT_RESOLUTION_TIMEOUT,
        }
    }
}

impl MessagingConfig {
    /// Configuration tuned for in-process and loopback deployments.
    pub fn local() -> Self {
        Self {
            send_msg_retry_interval: Duration::from_millis(50),
            max_retry_delay: Duration::from_secs(1),
            backoff: BackoffStrategy::Fixed { jitter: false },
            worker_count: 2,
            queue_capacity: 1000,
            default_round_trip_ttl: Duration::from_secs(5),
            routing_table_cleanup_interval: Duration::ZERO,
            shutdown_drain_timeout: Duration::from_millis(500),
            parent_resolution_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Set the retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.send_msg_retry_interval = interval;
        self
    }

    /// Set the backoff strategy.
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the maximum retry delay.
    pub fn with_max_retry_delay(mut self, max: Duration) -> Self {
        self.max_retry_delay = max;
        self
    }

    /// Limit the number of retries per message.
    pub fn with_max_retry_count(mut self, max: Option<u32>) -> Self {
        self.max_retry_count = max;
        self
    }

    /// Set the size of the delivery worker pool.
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    /// Set the delivery queue bound.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the parent router lookup deadline.
    pub fn with_parent_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.parent_resolution_timeout = timeout;
        self
    }

    /// Set the default round-trip TTL.
    pub fn with_round_trip_ttl(mut self, ttl: Duration) -> Self {
        self.default_round_trip_ttl = ttl;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MessagingConfig::default();
        assert_eq!(config.send_msg_retry_interval, Duration::from_secs(3));
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.max_retry_count, None);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.parent_resolution_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MessagingConfig =
            serde_json::from_str(r#"{"send_msg_retry_interval": 250, "worker_count": 8}"#)
                .unwrap();
        assert_eq!(config.send_msg_retry_interval, Duration::from_millis(250));
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.queue_capacity, 10_000);
    }

    #[test]
    fn test_builder_setters() {
        let config = MessagingConfig::local()
            .with_retry_interval(Duration::from_millis(10))
            .with_max_retry_count(Some(3))
            .with_backoff(BackoffStrategy::Fixed { jitter: true })
            .with_parent_resolution_timeout(Duration::from_millis(250));
        assert_eq!(config.send_msg_retry_interval, Duration::from_millis(10));
        assert_eq!(config.parent_resolution_timeout, Duration::from_millis(250));
        assert_eq!(config.max_retry_count, Some(3));
        assert_eq!(config.backoff, BackoffStrategy::Fixed { jitter: true });
    }
}
