use std::time::Duration;

use tokio::time::Instant;

use crate::error::AttemptError;

/// Minimum throughput a transfer must sustain. Mirrors curl's
/// `--speed-limit`/`--speed-time` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallPolicy {
    pub window: Duration,
    /// Bytes per second.
    pub min_rate: u64,
}

impl StallPolicy {
    pub fn is_disabled(&self) -> bool {
        self.window.is_zero() || self.min_rate == 0
    }

    fn min_bytes(&self) -> u64 {
        (self.min_rate as f64 * self.window.as_secs_f64()) as u64
    }
}

/// Tracks bytes received in consecutive windows and fails the attempt when a
/// full window falls short of the policy.
#[derive(Debug)]
pub struct StallMonitor {
    policy: StallPolicy,
    window_start: Instant,
    window_bytes: u64,
}

impl StallMonitor {
    pub fn new(policy: StallPolicy) -> Self {
        Self { policy, window_start: Instant::now(), window_bytes: 0 }
    }

    /// End of the current window, or `None` when stall detection is off.
    pub fn deadline(&self) -> Option<Instant> {
        if self.policy.is_disabled() {
            None
        } else {
            Some(self.window_start + self.policy.window)
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.window_bytes += bytes as u64;
    }

    /// Error for a window that closed below the minimum rate.
    pub fn stalled(&self) -> AttemptError {
        AttemptError::Stalled { bytes: self.window_bytes, window: self.policy.window }
    }

    pub fn check(&mut self, now: Instant) -> Result<(), AttemptError> {
        let Some(deadline) = self.deadline() else { return Ok(()) };
        if now < deadline {
            return Ok(());
        }
        if self.window_bytes < self.policy.min_bytes() {
            return Err(self.stalled());
        }
        self.window_start = now;
        self.window_bytes = 0;
        Ok(())
    }
}
