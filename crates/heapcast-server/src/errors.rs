//! Server error types.

use heapcast_core::ids::HeapUri;

use crate::transport::TransportError;

/// A subscribe request that did not result in a live subscription.
///
/// Every variant is fully rolled back before it is returned.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The engine is shutting down.
    #[error("push engine is shutting down")]
    Shutdown,

    /// The heap had already reached end-of-life.
    #[error("heap {0} is terminated")]
    HeapTerminated(HeapUri),

    /// No publisher serves the requested heap.
    #[error("no published heap at {0}")]
    UnknownHeap(HeapUri),

    /// The reply could not be written, so the client never learned the subscription.
    #[error("failed to send subscription reply: {0}")]
    Reply(#[source] TransportError),
}

impl SubscribeError {
    /// Stable error code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Shutdown => "SHUTTING_DOWN",
            Self::HeapTerminated(_) => "HEAP_TERMINATED",
            Self::UnknownHeap(_) => "UNKNOWN_HEAP",
            Self::Reply(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SubscribeError::Shutdown.code(), "SHUTTING_DOWN");
        assert_eq!(
            SubscribeError::HeapTerminated("heapcast://x".into()).code(),
            "HEAP_TERMINATED"
        );
        assert_eq!(
            SubscribeError::Reply(TransportError::Closed).code(),
            "INTERNAL_ERROR"
        );
    }
}
