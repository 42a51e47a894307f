//! Liveness deadline for detecting silently dead connections
//!
//! Some transports stop yielding events without ever raising an error
//! (half-open sockets, watch streams parked on a dead endpoint). The feed
//! driver bounds every receive with the watchdog deadline; when the
//! deadline fires it probes the connection and replaces it if the
//! transport no longer reports it live. Because the deadline and the
//! receive race inside one `select!`, a probe can never overlap an
//! in-flight receive.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Watchdog {
    interval: Duration,
    deadline: Instant,
}

impl Watchdog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: Instant::now() + interval,
        }
    }

    /// The instant at which the current liveness window expires
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Start a fresh liveness window from now
    pub fn re_arm(&mut self) {
        self.deadline = Instant::now() + self.interval;
    }

    /// Configured probe interval
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_one_interval_out() {
        let dog = Watchdog::new(Duration::from_secs(30));
        assert_eq!(dog.deadline(), Instant::now() + Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_re_arm_extends_deadline() {
        let mut dog = Watchdog::new(Duration::from_secs(10));
        let first = dog.deadline();

        tokio::time::advance(Duration::from_secs(7)).await;
        dog.re_arm();

        assert_eq!(dog.deadline(), first + Duration::from_secs(7));
        assert!(dog.deadline() > first);
    }
}
