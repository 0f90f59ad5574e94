//! Identity key derivation.

use serde::{Deserialize, Serialize};

/// Address used when a request carries no network origin.
pub const FALLBACK_ADDRESS: &str = "0.0.0.0";

/// Namespace prepended to identity keys when addressing the shared store.
const STORE_KEY_PREFIX: &str = "rate_";

/// What the calling middleware knows about the request's origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdentity {
    /// Authenticated subject id, if any
    #[serde(default)]
    pub subject: Option<String>,
    /// Network origin address of the request
    #[serde(default)]
    pub address: Option<String>,
}

impl RequestIdentity {
    /// An unauthenticated request from the given address.
    pub fn anonymous(address: impl Into<String>) -> Self {
        Self {
            subject: None,
            address: Some(address.into()),
        }
    }

    /// An authenticated request.
    pub fn authenticated(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            address: None,
        }
    }

    /// Attach a network address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Derive the key whose bucket this request contends for.
    ///
    /// The subject wins over the address; empty strings count as absent.
    pub fn key(&self) -> IdentityKey {
        match self.subject.as_deref().filter(|s| !s.is_empty()) {
            Some(subject) => IdentityKey::Subject(subject.to_string()),
            None => {
                let address = self
                    .address
                    .as_deref()
                    .filter(|a| !a.is_empty())
                    .unwrap_or(FALLBACK_ADDRESS);
                IdentityKey::Address(address.to_string())
            }
        }
    }
}

/// A key that uniquely identifies a rate-limited subject.
///
/// Subject keys render as `uid_<id>` and address keys as `ip_<addr>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    /// Keyed by authenticated subject id
    Subject(String),
    /// Keyed by network address
    Address(String),
}

impl IdentityKey {
    /// The key as a string, e.g. `uid_42` or `ip_10.0.0.1`.
    pub fn to_string_key(&self) -> String {
        match self {
            IdentityKey::Subject(id) => format!("uid_{}", id),
            IdentityKey::Address(addr) => format!("ip_{}", addr),
        }
    }

    /// The key under which the bucket is kept in the shared store.
    pub fn storage_key(&self) -> String {
        format!("{}{}", STORE_KEY_PREFIX, self.to_string_key())
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
