//! Restart policy for speech recognition after recoverable errors

use std::time::Duration;

/// Restart policy for the speech capture engine
///
/// Network failures back off exponentially and count against a budget;
/// once the budget is used up automatic restarts stop until a manual reset.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Consecutive network failures tolerated before auto-restart is suspended
    pub network_error_budget: u32,
    /// Delay after the first network failure (doubles each consecutive failure)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Delay before restarting after silence or a plain end of recognition
    pub quiet_restart_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            network_error_budget: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(16),
            quiet_restart_delay: Duration::from_millis(300),
        }
    }
}

impl RestartPolicy {
    /// Delay before the restart that follows the `failures`-th consecutive
    /// network failure: `min(base_delay * 2^(failures - 1), max_delay)`
    ///
    /// Non-decreasing in `failures`.
    #[must_use]
    pub fn network_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Whether `failures` consecutive network failures exhaust the budget
    #[must_use]
    pub const fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.network_error_budget
    }
}

/// Consecutive network-failure counter for one capture service
#[derive(Debug, Clone, Default)]
pub struct NetworkErrorState {
    consecutive: u32,
    suspended: bool,
}

impl NetworkErrorState {
    /// Record a network failure
    ///
    /// Returns the restart delay, or `None` once the budget is exhausted and
    /// auto-restart is suspended.
    pub fn record_failure(&mut self, policy: &RestartPolicy) -> Option<Duration> {
        self.consecutive = self.consecutive.saturating_add(1);
        if policy.is_exhausted(self.consecutive) {
            self.suspended = true;
            return None;
        }
        Some(policy.network_delay(self.consecutive))
    }

    /// Clear the counter after a successful recognition result
    pub const fn record_success(&mut self) {
        if !self.suspended {
            self.consecutive = 0;
        }
    }

    /// Manual reset, the only way out of suspension
    pub const fn reset(&mut self) {
        self.consecutive = 0;
        self.suspended = false;
    }

    /// Consecutive failures so far
    #[must_use]
    pub const fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Whether auto-restart is suspended
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.suspended
    }
}
