//! Reconnect scheduling and liveness tracking

use std::time::Duration;
use tokio::time::Instant;

pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Exponential reconnect backoff
///
/// The N-th consecutive failure waits `min(base * 2^(N-1), cap)`. Once
/// `max_attempts` is exhausted no further delay is produced.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY, MAX_RECONNECT_ATTEMPTS)
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Called after a successful open
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay for attempt `n` (1-based)
    pub fn delay_for(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Record a close and return the delay before the next attempt
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for(self.attempts))
    }
}

/// Deadline tracker for ping/pong liveness
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    deadline: Duration,
    last_seen: Instant,
}

impl LivenessMonitor {
    /// Starts a fresh baseline; build one per session
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            last_seen: Instant::now(),
        }
    }

    pub fn record_response(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Instant at which the session counts as silent
    pub fn deadline_at(&self) -> Instant {
        self.last_seen + self.deadline
    }

    #[cfg(test)]
    pub fn is_expired(&self) -> bool {
        self.last_seen.elapsed() > self.deadline
    }

    pub fn silent_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}
