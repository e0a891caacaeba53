#![forbid(unsafe_code)]

//! Policy-as-data configuration for the cache.
//!
//! A [`CachePolicy`] is plain data so deployments can tune it without code
//! changes. With the `policy-config` feature enabled it can be loaded from a
//! TOML document:
//!
//! ```toml
//! eviction = "evict-unobserved"
//! ```

use serde::{Deserialize, Serialize};

/// What happens to a cache entry when its last subscriber leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Keep the entry indefinitely. Matches the observed production
    /// behavior: entries survive unmount/remount cycles so a returning
    /// consumer starts from cached data.
    #[default]
    Retain,
    /// Drop the entry when its subscriber count reaches zero and no request
    /// is in flight for it. Bounds memory growth in long-lived sessions at
    /// the cost of refetching after a full unmount.
    EvictUnobserved,
}

/// Construction-time configuration for a [`ReactiveCache`].
///
/// [`ReactiveCache`]: crate::ReactiveCache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Zero-subscriber eviction behavior.
    pub eviction: EvictionPolicy,
}

impl CachePolicy {
    /// The default policy: retain entries indefinitely.
    #[must_use]
    pub fn retain() -> Self {
        Self {
            eviction: EvictionPolicy::Retain,
        }
    }

    /// Evict entries once nothing observes them.
    #[must_use]
    pub fn evict_unobserved() -> Self {
        Self {
            eviction: EvictionPolicy::EvictUnobserved,
        }
    }

    /// Parse a policy from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns the TOML parse error message when the document is malformed
    /// or contains unknown values.
    #[cfg(feature = "policy-config")]
    pub fn from_toml_str(doc: &str) -> Result<Self, String> {
        toml::from_str(doc).map_err(|e| e.to_string())
    }
}
