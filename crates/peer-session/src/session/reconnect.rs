//! Relay reconnection policy
//!
//! Bounded exponential backoff: the n-th attempt waits `base * 2^n`,
//! clamped to the configured ceiling.

use crate::config::SessionConfig;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts (default: 5)
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds (default: 1000ms)
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 10000ms)
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 10000,
        }
    }
}

impl ReconnectPolicy {
    /// Policy from the session configuration
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay_ms: config.base_reconnect_delay_ms,
            max_delay_ms: config.max_reconnect_delay_ms,
        }
    }

    /// Delay before attempt number `attempt` (1-based)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Check if another attempt is allowed after `attempts`
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Reconnect bookkeeping for one relay session
///
/// The attempt ceiling is not stored here; it lives on [`ReconnectPolicy`]
/// and is checked with [`ReconnectPolicy::should_retry`].
#[derive(Debug, Default)]
pub struct ReconnectState {
    /// Attempts since the last successful open
    pub attempts: u32,
    /// Pending reconnect timer
    pub pending_timer: Option<JoinHandle<()>>,
}

impl ReconnectState {
    /// Abort the pending timer, if any
    pub fn cancel_timer(&mut self) -> bool {
        match self.pending_timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel the timer and start counting from zero
    pub fn reset(&mut self) {
        self.cancel_timer();
        self.attempts = 0;
    }

    /// Whether a reconnect timer is pending
    pub fn has_pending_timer(&self) -> bool {
        self.pending_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for ReconnectState {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
