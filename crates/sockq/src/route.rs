#![forbid(unsafe_code)]

//! Route and key types: the identity layer of the core.
//!
//! Everything downstream — dedup, caching, listener dispatch — hangs off the
//! deterministic derivation rules defined here:
//!
//! 1. Two [`EmitDescriptor`]s are equivalent iff their target route and the
//!    canonical serialization of their payload match.
//! 2. Equivalent `(emit, response_route)` pairs always derive the same
//!    [`DedupKey`]; the fingerprint string is retained so an accidental hash
//!    collision between unrelated requests is detectable, not silent.
//! 3. The same logical query always derives the same [`CacheKey`], across
//!    calls and across independent consumers.
//!
//! Canonical serialization relies on `serde_json`'s default map being
//! ordered by key, so two payloads that differ only in field insertion order
//! produce the same fingerprint.

use std::hash::{BuildHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed seeds so a key derived twice in one process is identical even
/// across separately-constructed hashers.
const DEDUP_SEEDS: (u64, u64, u64, u64) = (
    0x736f_636b_7100_0001,
    0x9e37_79b9_7f4a_7c15,
    0x2545_f491_4f6c_dd1d,
    0x27d4_eb2f_1656_67c5,
);

/// Stable identifier for a class of pushed messages, e.g.
/// `"metrics/list:getList"`. Equality is by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteDescriptor(String);

impl RouteDescriptor {
    /// Create a route descriptor from any string-like value.
    #[must_use]
    pub fn new(route: impl Into<String>) -> Self {
        Self(route.into())
    }

    /// The route as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RouteDescriptor {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for RouteDescriptor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RouteDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An outbound request: the route it is emitted on plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitDescriptor {
    /// Route the request is emitted on.
    pub route: RouteDescriptor,
    /// Request payload, already decoded from/encodable to the wire format.
    pub payload: Value,
}

impl EmitDescriptor {
    /// Create an emit descriptor.
    #[must_use]
    pub fn new(route: impl Into<RouteDescriptor>, payload: Value) -> Self {
        Self {
            route: route.into(),
            payload,
        }
    }

    /// Canonical fingerprint: emit route plus the canonical payload
    /// serialization. Two descriptors are equivalent iff fingerprints match.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!("{}\u{1f}{}", self.route, canonical_json(&self.payload))
    }
}

/// Key identifying "the same logical request" for deduplication.
///
/// Derived from an [`EmitDescriptor`] and the response route it will wait
/// on. The key is a 64-bit hash; the correlator keeps the originating
/// fingerprint next to it and treats an equal key with a different
/// fingerprint as a [`DuplicateRouteConflict`] defect.
///
/// [`DuplicateRouteConflict`]: crate::SockqError::DuplicateRouteConflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey(u64);

impl DedupKey {
    /// Derive the key for `(emit, response_route)`.
    #[must_use]
    pub fn derive(emit: &EmitDescriptor, response_route: &RouteDescriptor) -> Self {
        let state = ahash::RandomState::with_seeds(
            DEDUP_SEEDS.0,
            DEDUP_SEEDS.1,
            DEDUP_SEEDS.2,
            DEDUP_SEEDS.3,
        );
        let mut hasher = state.build_hasher();
        emit.fingerprint().hash(&mut hasher);
        response_route.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Raw key value (diagnostics only).
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Full correlation identity of a request: the dedup key plus the
/// fingerprint it was derived from.
#[must_use]
pub fn correlation_identity(
    emit: &EmitDescriptor,
    response_route: &RouteDescriptor,
) -> (DedupKey, String) {
    (
        DedupKey::derive(emit, response_route),
        format!("{}\u{1f}{}", emit.fingerprint(), response_route),
    )
}

/// Key identifying "the same logical query result" for caching.
///
/// Derive it from a route plus filter parameters, or construct it verbatim
/// when the caller already has a stable key string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Use `key` verbatim as the cache key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a key from a route and its filter/argument parameters.
    ///
    /// The same `(route, params)` always yields the same key; `Value::Null`
    /// params collapse to the bare route.
    #[must_use]
    pub fn derive(route: &RouteDescriptor, params: &Value) -> Self {
        if params.is_null() {
            Self(route.as_str().to_owned())
        } else {
            Self(format!("{route}?{}", canonical_json(params)))
        }
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical JSON text for fingerprinting. `serde_json`'s default map is
/// key-ordered, so serialization is already order-insensitive.
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("null"))
}
