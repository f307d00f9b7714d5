//! When a crashed consumer loop is restarted, and after how long.

use std::time::Duration;

/// Restart budget for a supervised loop.
///
/// Crashes are counted consecutively by the supervisor; a clean iteration
/// resets the count. The wait before restart `n` is `base_delay * 2^(n-1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Stop the consumer on the first crash.
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            ..Default::default()
        }
    }

    /// Same wait before every restart.
    pub fn fixed(max_restarts: u32, delay: Duration) -> Self {
        Self {
            max_restarts,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Whether the loop may come back after its `crash`-th consecutive crash.
    pub fn allows_restart(&self, crash: u32) -> bool {
        crash <= self.max_restarts
    }

    /// Wait before restarting after the `crash`-th consecutive crash.
    pub fn backoff(&self, crash: u32) -> Duration {
        let doublings = crash.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}
