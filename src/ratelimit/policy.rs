//! Limit and window configuration for an admission controller.

use std::time::Duration;

/// Default number of requests admitted per window.
pub const DEFAULT_MAX_REQUESTS: u64 = 200;
/// Default window length in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// The limit/window pair enforced by one controller.
///
/// Non-positive inputs are silently floored to 1, so a policy always
/// admits at least one request per window of at least one second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    max_requests: u64,
    window_secs: u64,
}

impl RateLimitPolicy {
    /// Create a policy, clamping both values to at least 1.
    pub fn new(max_requests: i64, window_secs: i64) -> Self {
        Self {
            max_requests: max_requests.max(1) as u64,
            window_secs: window_secs.max(1) as u64,
        }
    }

    /// Maximum requests admitted per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}
