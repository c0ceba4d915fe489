//! Publisher-side catalog: resolves subscribe requests to published heaps.

use std::collections::HashMap;
use std::sync::Arc;

use heapcast_core::heap::Heap;
use heapcast_core::ids::HeapUri;
use heapcast_core::subscription::{ConnectedResponse, Subscription};
use parking_lot::RwLock;
use tracing::info;

/// Heaps this node publishes, by uri.
#[derive(Default)]
pub struct HeapCatalog {
    heaps: RwLock<HashMap<HeapUri, Arc<dyn Heap>>>,
}

impl HeapCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `heap` available to subscribers, replacing any heap at the same uri.
    pub fn publish(&self, heap: Arc<dyn Heap>) {
        let uri = heap.uri().clone();
        let replaced = self.heaps.write().insert(uri.clone(), heap).is_some();
        info!(uri = %uri, replaced, "heap published");
    }

    /// Stop offering the heap at `uri` to new subscribers.
    pub fn withdraw(&self, uri: &HeapUri) -> Option<Arc<dyn Heap>> {
        self.heaps.write().remove(uri)
    }

    /// Connect to the heap at `uri` with a fresh subscription handle.
    pub fn connect(&self, uri: &HeapUri) -> Option<ConnectedResponse> {
        let heap = self.heaps.read().get(uri).cloned()?;
        Some(ConnectedResponse::new(heap, Subscription::new()))
    }

    /// Published uris, sorted.
    pub fn uris(&self) -> Vec<HeapUri> {
        let mut uris: Vec<HeapUri> = self.heaps.read().keys().cloned().collect();
        uris.sort();
        uris
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapcast_core::heap::MemoryHeap;

    #[test]
    fn connect_hands_out_fresh_subscriptions() {
        let catalog = HeapCatalog::new();
        catalog.publish(Arc::new(MemoryHeap::new("heapcast://a")));
        let uri = HeapUri::from("heapcast://a");
        let first = catalog.connect(&uri).unwrap();
        let second = catalog.connect(&uri).unwrap();
        assert!(Arc::ptr_eq(&first.heap, &second.heap));
        assert!(!Arc::ptr_eq(&first.subscription, &second.subscription));
    }

    #[test]
    fn withdrawn_heap_cannot_be_connected() {
        let catalog = HeapCatalog::new();
        catalog.publish(Arc::new(MemoryHeap::new("heapcast://a")));
        let uri = HeapUri::from("heapcast://a");
        assert!(catalog.withdraw(&uri).is_some());
        assert!(catalog.connect(&uri).is_none());
        assert!(catalog.uris().is_empty());
    }
}
