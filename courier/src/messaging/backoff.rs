use crate::config::{BackoffStrategy, MessagingConfig};
use rand::Rng;
use std::time::Duration;

/// Computes the delay before the next delivery attempt.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    interval: Duration,
    max_delay: Duration,
    strategy: BackoffStrategy,
}

impl Backoff {
    /// Backoff as configured for the router.
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            interval: config.send_msg_retry_interval,
            max_delay: config.max_retry_delay,
            strategy: config.backoff,
        }
    }

    /// Delay before retry number `retries + 1`.
    pub fn delay(&self, retries: u32) -> Duration {
        let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed { jitter: false } => interval_ms,
            BackoffStrategy::Fixed { jitter: true } => {
                interval_ms.saturating_add(random_up_to(interval_ms))
            }
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(retries).unwrap_or(u64::MAX);
                interval_ms.saturating_add(random_up_to(interval_ms.saturating_mul(factor)))
            }
        };
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

fn random_up_to(bound_ms: u64) -> u64 {
    if bound_ms == 0 {
        return 0;
    }
    rand::rng().random_range(0..=bound_ms)
}
