//! Retry policy and backoff computation for fetch tasks.

use std::time::Duration;

use crate::config::loader::{parse_duration, ConfigError};
use crate::config::types::RetryConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        if config.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        Ok(Self {
            max_attempts: config.max_attempts,
            base_delay: parse_duration(&config.base_delay)?,
            max_delay: parse_duration(&config.max_delay)?,
        })
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// An upstream `Retry-After` hint wins, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
