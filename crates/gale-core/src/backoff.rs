//! Reconnect admission policy.
//!
//! The delay is a pure function of the consecutive failure count and a
//! rolling success rate over the most recent attempts, so it can be tested
//! exhaustively without any clock or I/O.

use std::collections::VecDeque;
use std::time::Duration;

/// Upper bound on any computed delay.
pub const MAX_DELAY: Duration = Duration::from_secs(300);

/// Attempts considered when computing the rolling success rate.
const WINDOW: usize = 30;

/// Delay before the next connection attempt, given `n` consecutive failures
/// and a rolling success rate `r` in `[0, 1]`.
pub fn delay_for(consecutive_failures: u32, success_rate: f64) -> Duration {
    let base_secs: u64 = match consecutive_failures {
        0 => 0,
        1 => 5,
        2 => 10,
        3 => 15,
        4..=10 => 30,
        11..=30 => 60,
        _ => 120,
    };
    let secs = if success_rate < 0.2 && consecutive_failures > 5 {
        (base_secs * 2).min(MAX_DELAY.as_secs())
    } else {
        base_secs
    };
    Duration::from_secs(secs)
}

/// Tracks connection attempt outcomes and hands out reconnect delays.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    window: VecDeque<bool>,
    consecutive_failures: u32,
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW),
            consecutive_failures: 0,
        }
    }

    /// Record an attempt that reached stable serving.
    pub fn record_success(&mut self) {
        self.push_outcome(true);
        self.consecutive_failures = 0;
    }

    /// Record an attempt that failed to connect, register, or stay up.
    pub fn record_failure(&mut self) {
        self.push_outcome(false);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Successes over attempts in the rolling window; 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let successes = self.window.iter().filter(|s| **s).count();
        successes as f64 / self.window.len() as f64
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay to apply before the next attempt.
    pub fn next_delay(&self) -> Duration {
        delay_for(self.consecutive_failures, self.success_rate())
    }

    /// Forget all history. Applied after a session stays in serving long
    /// enough to be considered healthy.
    pub fn reset(&mut self) {
        self.window.clear();
        self.consecutive_failures = 0;
    }

    fn push_outcome(&mut self, success: bool) {
        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new()
    }
}
