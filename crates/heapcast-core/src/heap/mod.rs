//! The published-object ("heap") contract consumed by the push engine.
//!
//! A heap is a live, externally-owned object tree. The engine never inspects its
//! structure; it only needs three capabilities:
//!
//! - **Listening**: register a [`HeapListener`] that is handed every [`Update`]
//!   synchronously on the mutating thread.
//! - **Traversal**: replay the full current state as one synthetic [`Update`].
//! - **Identity**: a stable [`HeapUri`].
//!
//! Implementations must serialise listener callbacks and [`Heap::traverse`]
//! against each other, so a snapshot reflects exactly the updates whose
//! callbacks have already returned.

mod memory;

pub use memory::{HeapTxn, MemoryHeap};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::HeapUri;

/// Node identifier within one heap. The root is always [`ROOT_NODE`].
pub type NodeId = u32;

/// Identifier of the root node of every heap.
pub const ROOT_NODE: NodeId = 0;

/// Shape of a heap node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    /// Keyed children addressed by field name.
    Object,
    /// Ordered children addressed by index.
    List,
    /// Leaf holding a JSON value.
    Scalar,
}

impl NodeKind {
    /// Whether nodes of this kind may have children.
    pub fn is_container(self) -> bool {
        !matches!(self, Self::Scalar)
    }
}

/// One atomic structural or value change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum UpdateAction {
    /// The root node exists with the given kind.
    InstallRoot {
        /// Root node id.
        node: NodeId,
        /// Root kind.
        kind: NodeKind,
    },
    /// A named child was installed under an object node.
    InstallField {
        /// Parent node id.
        parent: NodeId,
        /// Field name.
        name: String,
        /// New node id.
        node: NodeId,
        /// New node kind.
        kind: NodeKind,
    },
    /// An indexed child was installed under a list node.
    InstallIndex {
        /// Parent node id.
        parent: NodeId,
        /// Position in the list.
        index: u32,
        /// New node id.
        node: NodeId,
        /// New node kind.
        kind: NodeKind,
    },
    /// A scalar node took a new value.
    SetScalar {
        /// Scalar node id.
        node: NodeId,
        /// New value.
        value: Value,
    },
    /// A node and its whole subtree were removed.
    RemoveNode {
        /// Removed node id.
        node: NodeId,
    },
    /// The heap reached end-of-life. Always the last action a heap emits.
    Terminate,
}

/// Ordered, atomic list of actions produced by one heap mutation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Actions in application order.
    pub actions: Vec<UpdateAction>,
}

impl Update {
    /// Wrap a list of actions.
    pub fn new(actions: Vec<UpdateAction>) -> Self {
        Self { actions }
    }

    /// Whether this update carries the terminal marker.
    pub fn is_terminal(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, UpdateAction::Terminate))
    }

    /// Number of actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the update carries no actions.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Receives every update a heap applies, on the mutating thread.
pub trait HeapListener: Send + Sync {
    /// Called once per applied mutation, in application order.
    fn apply_update(&self, update: &Update);
}

/// A live object graph that can be published to subscribers.
pub trait Heap: Send + Sync {
    /// Stable identity of this heap.
    fn uri(&self) -> &HeapUri;

    /// Start delivering updates to `listener`.
    fn add_listener(&self, listener: Arc<dyn HeapListener>);

    /// Stop delivering updates to `listener` (matched by pointer identity).
    fn remove_listener(&self, listener: &Arc<dyn HeapListener>);

    /// Replay the full current state as one synthetic update.
    ///
    /// A terminated heap's snapshot ends with [`UpdateAction::Terminate`].
    fn traverse(&self, visitor: &mut dyn FnMut(&Update));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_detection() {
        let plain = Update::new(vec![UpdateAction::RemoveNode { node: 3 }]);
        assert!(!plain.is_terminal());
        let terminal = Update::new(vec![
            UpdateAction::SetScalar {
                node: 1,
                value: json!(5),
            },
            UpdateAction::Terminate,
        ]);
        assert!(terminal.is_terminal());
        assert_eq!(terminal.len(), 2);
    }

    #[test]
    fn action_wire_shape() {
        let action = UpdateAction::InstallField {
            parent: 0,
            name: "price".into(),
            node: 4,
            kind: NodeKind::Scalar,
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["op"], "installField");
        assert_eq!(value["kind"], "scalar");
        assert_eq!(value["node"], 4);
    }
}
