//! Admission decisions and the quota header contract.

use serde::Serialize;

use super::bucket::Bucket;
use super::policy::RateLimitPolicy;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// HTTP status for a denied request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Whether a request may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Admitted,
    Denied,
}

/// The result of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub outcome: Outcome,
    /// The configured maximum requests per window
    pub limit: u64,
    /// Requests left in this window, zero when denied
    pub remaining: u64,
    /// Unix timestamp at which the window ends
    pub reset: i64,
    /// Seconds to wait before retrying, set only when denied
    pub retry_after: Option<u64>,
}

impl Decision {
    /// Decide on a bucket that already counts the current request.
    pub(crate) fn from_bucket(bucket: &Bucket, policy: &RateLimitPolicy, now: i64) -> Self {
        let limit = policy.max_requests();
        if bucket.count > limit {
            Self {
                outcome: Outcome::Denied,
                limit,
                remaining: 0,
                reset: bucket.reset_at,
                retry_after: Some(bucket.seconds_until_reset(now)),
            }
        } else {
            Self {
                outcome: Outcome::Admitted,
                limit,
                remaining: limit - bucket.count,
                reset: bucket.reset_at,
                retry_after: None,
            }
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.outcome == Outcome::Admitted
    }

    /// Headers to attach to whichever response is sent.
    ///
    /// `Retry-After` is only present on denied decisions.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(4);
        if let Some(retry_after) = self.retry_after {
            headers.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        headers.push((HEADER_LIMIT, self.limit.to_string()));
        headers.push((HEADER_REMAINING, self.remaining.to_string()));
        headers.push((HEADER_RESET, self.reset.to_string()));
        headers
    }
}
