#![forbid(unsafe_code)]

//! The transport seam.
//!
//! The physical socket (connect/reconnect, heartbeat, framing, auth) lives
//! outside this crate. The core consumes it through one narrow trait:
//! [`Transport::emit`] sends a request and fails synchronously when not
//! connected. Incoming frames and connection-state changes flow the other
//! way, through [`QueryClient::ingest`] and [`QueryClient::connection_lost`].
//!
//! [`QueryClient::ingest`]: crate::QueryClient::ingest
//! [`QueryClient::connection_lost`]: crate::QueryClient::connection_lost

use crate::route::EmitDescriptor;

/// Failure reported by [`Transport::emit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError(pub String);

impl TransportError {
    /// Create a transport error with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TransportError {}

/// Outbound half of the socket, as seen by the correlator.
pub trait Transport {
    /// Send `emit` over the wire.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the request cannot be sent, typically
    /// because the socket is not connected. A successful return means the
    /// request left this layer; it says nothing about the response.
    fn emit(&self, emit: &EmitDescriptor) -> Result<(), TransportError>;
}
