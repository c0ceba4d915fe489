//! Transport boundary: what the push engine needs from a connection layer.
//!
//! The engine never touches sockets. It writes pre-encoded frames to a
//! [`Session`] and answers subscribe requests through an [`OperationContext`].
//! Writes must not block. A failed write is never retried: the engine drops the
//! session's interest in the heap being delivered and closes the session.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use heapcast_core::errors::CodecError;
use heapcast_core::ids::SessionId;
use heapcast_core::protocol::{NewSubscription, ProtocolVersion};

use crate::errors::SubscribeError;

/// One client connection.
pub trait Session: Send + Sync {
    /// Stable id of this connection.
    fn id(&self) -> &SessionId;

    /// Wire version negotiated at connect time.
    fn protocol_version(&self) -> ProtocolVersion;

    /// Queue a frame for the client without blocking.
    fn write(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Must not call back into the engine; the
    /// transport reports the closed session once its own loops wind down.
    fn close(&self);
}

/// Shared session handle.
pub type SessionRef = Arc<dyn Session>;

/// A frame could not be handed to the client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is gone.
    #[error("session closed")]
    Closed,

    /// The outbound queue is full; the client is not keeping up.
    #[error("send queue full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// The reply could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The RPC-side context a subscribe request arrived on.
pub trait OperationContext: Send + Sync {
    /// Operation name, for logs.
    fn operation(&self) -> &str;

    /// Send the success or error response for the request.
    fn respond(&self, outcome: Result<&NewSubscription, &SubscribeError>) -> Result<(), TransportError>;
}

/// Extra caller-supplied fields appended to connected-object audit log lines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogExtension {
    fields: Vec<(String, String)>,
}

impl LogExtension {
    /// Empty extension.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for LogExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
