//! Reconnection backoff and the failure policy for handler errors.

use std::time::Duration;

/// Upper bound for a single reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff used when (re)connecting to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Creates a new policy.
    ///
    /// # Arguments
    /// * `max_attempts` - Number of connection attempts before giving up.
    /// * `base_delay` - Delay after the first failed attempt, doubled for every
    ///   following one.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: MAX_RECONNECT_DELAY,
        }
    }

    /// Returns the delay to wait after the failed attempt number `attempt`
    /// (1-based), or `None` once the attempt budget is spent.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        Some(delay.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500))
    }
}

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Requeue on first failure, dead-letter once the message comes back
    /// marked as redelivered.
    #[default]
    RequeueOnce,
    /// Dead-letter on the first failure.
    DeadLetter,
}

/// Settlement decided for a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Requeue,
    DeadLetter,
}

impl FailurePolicy {
    /// Parses the textual form used in the environment.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "requeue-once" | "requeue_once" => Some(FailurePolicy::RequeueOnce),
            "dead-letter" | "dead_letter" => Some(FailurePolicy::DeadLetter),
            _ => None,
        }
    }

    pub fn action(&self, redelivered: bool) -> FailureAction {
        match self {
            FailurePolicy::RequeueOnce if !redelivered => FailureAction::Requeue,
            _ => FailureAction::DeadLetter,
        }
    }
}
