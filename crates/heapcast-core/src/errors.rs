//! Error types shared across heapcast crates.

use crate::heap::NodeId;

/// Errors raised by the in-memory reference heap.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeapError {
    /// The heap has emitted its terminal update; no further mutation is allowed.
    #[error("heap is terminated")]
    Terminated,

    /// A mutation referenced a node that does not exist.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// A structural install targeted a scalar node.
    #[error("node {0} is not a container")]
    NotAContainer(NodeId),

    /// The root node cannot be removed.
    #[error("the root node cannot be removed")]
    RootRemoval,
}

/// Errors raised while encoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[error("failed to encode message: {0}")]
    Json(#[from] serde_json::Error),
}
