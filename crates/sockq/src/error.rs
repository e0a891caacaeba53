#![forbid(unsafe_code)]

//! Error types for the correlation/cache core.
//!
//! Every failure that crosses a component boundary is converted to a
//! [`SockqError`] at that boundary; no component lets a caller-visible panic
//! or a foreign error type escape. Errors are `Clone` because the same value
//! may be fanned out to several waiters and stored in a cache entry.

use crate::route::RouteDescriptor;

/// Errors surfaced by the registry, correlator, cache, and bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockqError {
    /// The transport's `emit` failed (typically: not connected). No response
    /// listener was registered for the request.
    TransportEmitFailed(String),
    /// The transport reported a disconnect while a request was pending. The
    /// pending entry is cleared so a later call starts fresh.
    ConnectionLost,
    /// A caller-supplied merge function failed. The cache entry keeps its
    /// previous value; the error reaches only the caller that triggered the
    /// merge.
    MergeFunctionThrew(String),
    /// Two unrelated emit descriptors produced the same dedup key. This is a
    /// programming error (key derivation must not collide), not a condition
    /// to recover from silently.
    DuplicateRouteConflict {
        /// The response route of the conflicting request.
        route: RouteDescriptor,
        /// The colliding key value.
        dedup_key: u64,
    },
}

impl SockqError {
    /// Whether this error came from the transport layer (emit failure or
    /// disconnect), as opposed to a caller-supplied merge or a key conflict.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TransportEmitFailed(_) | Self::ConnectionLost
        )
    }
}

impl std::fmt::Display for SockqError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransportEmitFailed(msg) => write!(f, "transport emit failed: {msg}"),
            Self::ConnectionLost => write!(f, "connection lost while request was pending"),
            Self::MergeFunctionThrew(msg) => write!(f, "merge function failed: {msg}"),
            Self::DuplicateRouteConflict { route, dedup_key } => {
                write!(
                    f,
                    "dedup key collision on route '{route}' (key {dedup_key:#x})"
                )
            }
        }
    }
}

impl std::error::Error for SockqError {}
