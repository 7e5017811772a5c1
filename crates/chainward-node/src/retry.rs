//! Retry backoff for runtime calls.

use std::time::Duration;

use chainward_core::config::NodesConfig;

/// Bounded exponential backoff: `initial`, `2*initial`, ... capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_config(config: &NodesConfig) -> Self {
        Self {
            initial: config.retry_initial_backoff,
            max: config.retry_max_backoff,
            max_attempts: config.retry_max_attempts.max(1),
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_the_cap() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 5,
        };
        let delays: Vec<u64> = (0..7).map(|r| backoff.delay(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert!(backoff.allows(4));
        assert!(!backoff.allows(5));
        assert_eq!(backoff.delay(100), Duration::from_secs(30));
    }
}
