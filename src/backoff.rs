//! Exponential backoff policy for reconnect attempts
//!
//! The policy is pure arithmetic over a config; the feed driver owns a
//! [`BackoffState`] and consults it between reconnect attempts. State is
//! reset only when an event is actually delivered downstream, so a
//! connection that comes up, yields nothing, and dies again keeps paying
//! increasing delays.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt (milliseconds)
    pub base_delay_ms: u64,

    /// Upper bound on any single delay (milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor applied after each attempt
    ///
    /// Values below 1.0 are treated as 1.0 (fixed-interval retry).
    pub multiplier: f64,

    /// Optional cap on consecutive reconnect attempts
    ///
    /// `None` retries forever. `Some(0)` disables reconnection entirely:
    /// the first retriable failure terminates the feed.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Fixed-interval retry (no exponential growth)
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            max_attempts: None,
        }
    }
}

/// Mutable backoff progression owned by a feed driver
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        let current = Duration::from_millis(config.base_delay_ms);
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    /// The delay to wait before the next reconnect attempt
    ///
    /// Returns the current delay and advances the progression:
    /// `delay * multiplier`, capped at `max_delay_ms`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let factor = self.config.multiplier.max(1.0);
        let advanced = self.current.mul_f64(factor);
        self.current = advanced.min(Duration::from_millis(self.config.max_delay_ms));
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Consecutive attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the attempt budget is spent
    pub fn exhausted(&self) -> bool {
        match self.config.max_attempts {
            Some(max) => self.attempts >= max,
            None => false,
        }
    }

    /// Return to the base delay and clear the attempt counter
    pub fn reset(&mut self) {
        self.current = Duration::from_millis(self.config.base_delay_ms);
        self.attempts = 0;
    }
}
