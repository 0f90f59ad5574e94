//! Fixed-window admission control.

mod bucket;
mod controller;
mod decision;
mod identity;
mod policy;

pub use bucket::Bucket;
pub use controller::AdmissionController;
pub use decision::{
    Decision, Outcome, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
    STATUS_TOO_MANY_REQUESTS,
};
pub use identity::{IdentityKey, RequestIdentity, FALLBACK_ADDRESS};
pub use policy::{RateLimitPolicy, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_SECS};
