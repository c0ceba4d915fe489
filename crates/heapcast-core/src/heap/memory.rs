//! In-memory reference implementation of the [`Heap`] contract.
//!
//! All mutation and traversal runs under one internal mutex, and listeners are
//! invoked before that mutex is released. That gives the snapshot guarantee the
//! engine relies on: a traversal sees either all or none of a mutation, and the
//! listeners have already seen exactly the same set.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::{Heap, HeapListener, NodeId, NodeKind, ROOT_NODE, Update, UpdateAction};
use crate::errors::HeapError;
use crate::ids::HeapUri;

#[derive(Clone, Debug)]
enum Slot {
    Field(String),
    Index(u32),
}

#[derive(Clone, Debug)]
struct NodeRecord {
    parent: Option<(NodeId, Slot)>,
    kind: NodeKind,
    value: Option<Value>,
}

struct Inner {
    nodes: BTreeMap<NodeId, NodeRecord>,
    next_node: NodeId,
    listeners: Vec<Arc<dyn HeapListener>>,
    terminated: bool,
}

/// Thread-safe in-memory object tree.
pub struct MemoryHeap {
    uri: HeapUri,
    inner: Mutex<Inner>,
}

/// Mutation handle passed to [`MemoryHeap::update`].
///
/// Every call is applied immediately and recorded; the recorded actions are
/// published as one [`Update`] when the closure returns.
pub struct HeapTxn<'a> {
    inner: &'a mut Inner,
    actions: Vec<UpdateAction>,
}

impl MemoryHeap {
    /// Create an empty heap whose root is an object node.
    pub fn new(uri: impl Into<HeapUri>) -> Self {
        let mut nodes = BTreeMap::new();
        let _ = nodes.insert(
            ROOT_NODE,
            NodeRecord {
                parent: None,
                kind: NodeKind::Object,
                value: None,
            },
        );
        Self {
            uri: uri.into(),
            inner: Mutex::new(Inner {
                nodes,
                next_node: ROOT_NODE + 1,
                listeners: Vec::new(),
                terminated: false,
            }),
        }
    }

    /// Apply a batch of mutations atomically and notify listeners once.
    ///
    /// Actions applied before an error are still published, so listeners always
    /// mirror the heap's actual state.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut HeapTxn<'_>) -> Result<R, HeapError>,
    ) -> Result<R, HeapError> {
        let mut inner = self.inner.lock();
        if inner.terminated {
            return Err(HeapError::Terminated);
        }
        let mut txn = HeapTxn {
            inner: &mut *inner,
            actions: Vec::new(),
        };
        let result = f(&mut txn);
        let actions = std::mem::take(&mut txn.actions);
        if !actions.is_empty() {
            let update = Update::new(actions);
            for listener in &inner.listeners {
                listener.apply_update(&update);
            }
        }
        result
    }

    /// Emit the terminal update. Subsequent mutations fail.
    pub fn terminate(&self) -> Result<(), HeapError> {
        self.update(|txn| {
            txn.terminate();
            Ok(())
        })
    }

    /// Whether [`terminate`](Self::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminated
    }

    /// Current value of a scalar node.
    pub fn value(&self, node: NodeId) -> Option<Value> {
        self.inner.lock().nodes.get(&node).and_then(|n| n.value.clone())
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

impl HeapTxn<'_> {
    /// Install a named child under an object node.
    pub fn install_field(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId, HeapError> {
        self.check_container(parent)?;
        let node = self.allocate(parent, Slot::Field(name.to_string()), kind);
        self.actions.push(UpdateAction::InstallField {
            parent,
            name: name.to_string(),
            node,
            kind,
        });
        Ok(node)
    }

    /// Install an indexed child under a list node.
    pub fn install_index(
        &mut self,
        parent: NodeId,
        index: u32,
        kind: NodeKind,
    ) -> Result<NodeId, HeapError> {
        self.check_container(parent)?;
        let node = self.allocate(parent, Slot::Index(index), kind);
        self.actions.push(UpdateAction::InstallIndex {
            parent,
            index,
            node,
            kind,
        });
        Ok(node)
    }

    /// Set the value of a scalar node.
    pub fn set(&mut self, node: NodeId, value: Value) -> Result<(), HeapError> {
        let record = self
            .inner
            .nodes
            .get_mut(&node)
            .ok_or(HeapError::UnknownNode(node))?;
        record.value = Some(value.clone());
        self.actions.push(UpdateAction::SetScalar { node, value });
        Ok(())
    }

    /// Remove a node and its subtree.
    pub fn remove(&mut self, node: NodeId) -> Result<(), HeapError> {
        if node == ROOT_NODE {
            return Err(HeapError::RootRemoval);
        }
        if !self.inner.nodes.contains_key(&node) {
            return Err(HeapError::UnknownNode(node));
        }
        let mut doomed = vec![node];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let current = doomed[cursor];
            doomed.extend(
                self.inner
                    .nodes
                    .iter()
                    .filter(|(_, r)| matches!(r.parent, Some((p, _)) if p == current))
                    .map(|(id, _)| *id),
            );
            cursor += 1;
        }
        for id in doomed {
            let _ = self.inner.nodes.remove(&id);
        }
        self.actions.push(UpdateAction::RemoveNode { node });
        Ok(())
    }

    /// Mark the heap terminated. The terminal action is always the last one published.
    pub fn terminate(&mut self) {
        self.inner.terminated = true;
        self.actions.push(UpdateAction::Terminate);
    }

    fn check_container(&self, node: NodeId) -> Result<(), HeapError> {
        match self.inner.nodes.get(&node) {
            None => Err(HeapError::UnknownNode(node)),
            Some(r) if !r.kind.is_container() => Err(HeapError::NotAContainer(node)),
            Some(_) => Ok(()),
        }
    }

    fn allocate(&mut self, parent: NodeId, slot: Slot, kind: NodeKind) -> NodeId {
        let node = self.inner.next_node;
        self.inner.next_node += 1;
        let _ = self.inner.nodes.insert(
            node,
            NodeRecord {
                parent: Some((parent, slot)),
                kind,
                value: None,
            },
        );
        node
    }
}

impl Heap for MemoryHeap {
    fn uri(&self) -> &HeapUri {
        &self.uri
    }

    fn add_listener(&self, listener: Arc<dyn HeapListener>) {
        self.inner.lock().listeners.push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn HeapListener>) {
        self.inner
            .lock()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn traverse(&self, visitor: &mut dyn FnMut(&Update)) {
        let inner = self.inner.lock();
        let mut actions = Vec::with_capacity(inner.nodes.len() * 2);
        // Node ids grow monotonically, so parents always precede children.
        for (&node, record) in &inner.nodes {
            match &record.parent {
                None => actions.push(UpdateAction::InstallRoot {
                    node,
                    kind: record.kind,
                }),
                Some((parent, Slot::Field(name))) => actions.push(UpdateAction::InstallField {
                    parent: *parent,
                    name: name.clone(),
                    node,
                    kind: record.kind,
                }),
                Some((parent, Slot::Index(index))) => actions.push(UpdateAction::InstallIndex {
                    parent: *parent,
                    index: *index,
                    node,
                    kind: record.kind,
                }),
            }
            if let Some(value) = &record.value {
                actions.push(UpdateAction::SetScalar {
                    node,
                    value: value.clone(),
                });
            }
        }
        if inner.terminated {
            actions.push(UpdateAction::Terminate);
        }
        visitor(&Update::new(actions));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Recorder(Mutex<Vec<Update>>);

    impl HeapListener for Recorder {
        fn apply_update(&self, update: &Update) {
            self.0.lock().push(update.clone());
        }
    }

    fn snapshot(heap: &MemoryHeap) -> Update {
        let mut out = Update::default();
        heap.traverse(&mut |u| out = u.clone());
        out
    }

    #[test]
    fn update_publishes_one_atomic_update() {
        let heap = MemoryHeap::new("heapcast://test");
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        heap.add_listener(recorder.clone());

        heap.update(|txn| {
            let price = txn.install_field(ROOT_NODE, "price", NodeKind::Scalar)?;
            txn.set(price, json!(1.25))
        })
        .unwrap();

        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 2);
        assert_matches!(seen[0].actions[0], UpdateAction::InstallField { node: 1, .. });
    }

    #[test]
    fn empty_update_is_not_published() {
        let heap = MemoryHeap::new("heapcast://test");
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        heap.add_listener(recorder.clone());
        heap.update(|_| Ok(())).unwrap();
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn traverse_replays_structure_and_values() {
        let heap = MemoryHeap::new("heapcast://test");
        heap.update(|txn| {
            let list = txn.install_field(ROOT_NODE, "items", NodeKind::List)?;
            let first = txn.install_index(list, 0, NodeKind::Scalar)?;
            txn.set(first, json!("a"))
        })
        .unwrap();

        let snap = snapshot(&heap);
        assert_matches!(snap.actions[0], UpdateAction::InstallRoot { node: 0, .. });
        assert_matches!(snap.actions[1], UpdateAction::InstallField { node: 1, .. });
        assert_matches!(snap.actions[2], UpdateAction::InstallIndex { parent: 1, index: 0, .. });
        assert_eq!(snap.len(), 4);
        assert!(!snap.is_terminal());
    }

    #[test]
    fn remove_drops_subtree() {
        let heap = MemoryHeap::new("heapcast://test");
        heap.update(|txn| {
            let obj = txn.install_field(ROOT_NODE, "nested", NodeKind::Object)?;
            let _ = txn.install_field(obj, "leaf", NodeKind::Scalar)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(heap.node_count(), 3);
        heap.update(|txn| txn.remove(1)).unwrap();
        assert_eq!(heap.node_count(), 1);
    }

    #[test]
    fn terminated_heap_rejects_mutation() {
        let heap = MemoryHeap::new("heapcast://test");
        heap.terminate().unwrap();
        assert!(heap.is_terminated());
        assert_eq!(heap.update(|_| Ok(())), Err(HeapError::Terminated));
        assert!(snapshot(&heap).is_terminal());
    }

    #[test]
    fn scalar_cannot_hold_children() {
        let heap = MemoryHeap::new("heapcast://test");
        let err = heap
            .update(|txn| {
                let leaf = txn.install_field(ROOT_NODE, "leaf", NodeKind::Scalar)?;
                txn.install_field(leaf, "child", NodeKind::Scalar)
            })
            .unwrap_err();
        assert_eq!(err, HeapError::NotAContainer(1));
        // The successful install before the error is still applied.
        assert_eq!(heap.node_count(), 2);
    }

    #[test]
    fn listeners_are_removed_by_identity() {
        let heap = MemoryHeap::new("heapcast://test");
        let a: Arc<dyn HeapListener> = Arc::new(Recorder(Mutex::new(Vec::new())));
        let b: Arc<dyn HeapListener> = Arc::new(Recorder(Mutex::new(Vec::new())));
        heap.add_listener(Arc::clone(&a));
        heap.add_listener(Arc::clone(&b));
        heap.remove_listener(&a);
        assert_eq!(heap.listener_count(), 1);
    }
}
