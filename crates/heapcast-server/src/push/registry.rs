//! Heap registry: the global index of live heaps and per-session interest.
//!
//! Guarded by the global lock. Lock order is per-object before global, so the
//! index is only mutated through a [`RegistryTxn`], which can only be opened
//! from a held [`HeapLock`]. Read-only lookups take the global lock alone and
//! never touch a per-object lock while holding it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use heapcast_core::heap::{Heap, HeapListener};
use heapcast_core::ids::{HeapId, HeapUri, SessionId};
use metrics::gauge;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::state::{HeapLock, HeapState};
use crate::metrics::PUSH_HEAPS_ACTIVE;

#[derive(Default)]
pub(crate) struct Indices {
    heaps: HashMap<HeapUri, Arc<HeapState>>,
    handles: HashMap<HeapId, HeapUri>,
    /// session -> uri -> live subscription count. Entries never hold zero.
    sessions: HashMap<SessionId, HashMap<HeapUri, usize>>,
}

impl Indices {
    /// Live subscriptions `session` holds on `uri`.
    pub(crate) fn interest(&self, session: &SessionId, uri: &HeapUri) -> usize {
        self.sessions
            .get(session)
            .and_then(|heaps| heaps.get(uri))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn add_interest(&mut self, session: &SessionId, uri: &HeapUri) {
        *self
            .sessions
            .entry(session.clone())
            .or_default()
            .entry(uri.clone())
            .or_insert(0) += 1;
    }

    pub(crate) fn remove_interest(&mut self, session: &SessionId, uri: &HeapUri) {
        let Some(heaps) = self.sessions.get_mut(session) else {
            return;
        };
        let remaining = match heaps.get_mut(uri) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            let _ = heaps.remove(uri);
        }
        if heaps.is_empty() {
            let _ = self.sessions.remove(session);
        }
    }

    /// Unlink `state` if it is still the registered instance for its uri.
    pub(crate) fn remove_heap(&mut self, state: &HeapState) -> bool {
        let current = self
            .heaps
            .get(state.uri())
            .is_some_and(|s| s.instance_id() == state.instance_id());
        if current {
            let _ = self.heaps.remove(state.uri());
            let _ = self.handles.remove(&state.heap_id());
            publish_gauge(self.heaps.len());
        }
        current
    }
}

/// The per-object lock of one heap plus the global lock, taken in that order.
pub(crate) struct RegistryTxn<'a> {
    pub(crate) heap: &'a mut HeapLock,
    pub(crate) index: MutexGuard<'a, Indices>,
}

impl HeapLock {
    /// Open the global index while this heap's lock is held.
    pub(crate) fn registry<'a>(&'a mut self, registry: &'a Registry) -> RegistryTxn<'a> {
        RegistryTxn {
            index: registry.index.lock(),
            heap: self,
        }
    }
}

pub(crate) struct Registry {
    index: Mutex<Indices>,
    next_heap_id: AtomicU64,
    next_instance: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            index: Mutex::new(Indices::default()),
            next_heap_id: AtomicU64::new(1),
            next_instance: AtomicU64::new(1),
        }
    }

    /// Find or create the live state for `heap` and return it locked.
    ///
    /// `make_listener` builds the change adapter for a newly created state; it
    /// is registered on the heap before this returns.
    pub(crate) fn acquire(
        &self,
        heap: &Arc<dyn Heap>,
        make_listener: &dyn Fn(&Arc<HeapState>) -> Arc<dyn HeapListener>,
    ) -> HeapLock {
        let uri = heap.uri();
        loop {
            let index = self.index.lock();
            let Some(existing) = index.heaps.get(uri).cloned() else {
                return self.create(index, heap, make_listener);
            };
            drop(index);

            let lock = existing.lock();
            let index = self.index.lock();
            let current = index.heaps.get(uri).map(|s| s.instance_id());
            match current {
                Some(id) if id == existing.instance_id() => return lock,
                Some(_) => {
                    debug!(uri = %uri, "heap replaced while waiting for its lock, retrying");
                }
                None => {
                    drop(lock);
                    return self.create(index, heap, make_listener);
                }
            }
        }
    }

    fn create(
        &self,
        mut index: MutexGuard<'_, Indices>,
        heap: &Arc<dyn Heap>,
        make_listener: &dyn Fn(&Arc<HeapState>) -> Arc<dyn HeapListener>,
    ) -> HeapLock {
        let heap_id = HeapId(self.next_heap_id.fetch_add(1, Ordering::Relaxed));
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let state = HeapState::new(heap_id, instance, Arc::clone(heap));
        // Not yet reachable by anyone else, so this cannot contend.
        let mut lock = state.lock();
        let _ = index.heaps.insert(state.uri().clone(), Arc::clone(&state));
        let _ = index.handles.insert(heap_id, state.uri().clone());
        publish_gauge(index.heaps.len());
        drop(index);

        let listener = make_listener(&state);
        heap.add_listener(Arc::clone(&listener));
        lock.listener = Some(listener);
        info!(uri = %state.uri(), heap_id = %heap_id, "heap registered");
        lock
    }

    pub(crate) fn get(&self, uri: &HeapUri) -> Option<Arc<HeapState>> {
        self.index.lock().heaps.get(uri).cloned()
    }

    pub(crate) fn uri_for(&self, heap_id: HeapId) -> Option<HeapUri> {
        self.index.lock().handles.get(&heap_id).cloned()
    }

    pub(crate) fn heaps(&self) -> Vec<Arc<HeapState>> {
        self.index.lock().heaps.values().cloned().collect()
    }

    pub(crate) fn heap_count(&self) -> usize {
        self.index.lock().heaps.len()
    }

    /// Live heaps `session` holds at least one subscription on.
    pub(crate) fn heaps_for_session(&self, session: &SessionId) -> Vec<Arc<HeapState>> {
        let index = self.index.lock();
        index
            .sessions
            .get(session)
            .map(|heaps| {
                heaps
                    .keys()
                    .filter_map(|uri| index.heaps.get(uri).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn session_heaps(&self, session: &SessionId) -> Vec<HeapUri> {
        let mut uris: Vec<HeapUri> = self
            .index
            .lock()
            .sessions
            .get(session)
            .map(|heaps| heaps.keys().cloned().collect())
            .unwrap_or_default();
        uris.sort();
        uris
    }

    pub(crate) fn interest(&self, session: &SessionId, uri: &HeapUri) -> usize {
        self.index.lock().interest(session, uri)
    }
}

#[allow(clippy::cast_precision_loss)]
fn publish_gauge(live: usize) {
    gauge!(PUSH_HEAPS_ACTIVE).set(live as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use heapcast_core::heap::{MemoryHeap, Update};

    struct Noop;

    impl HeapListener for Noop {
        fn apply_update(&self, _update: &Update) {}
    }

    fn noop(_: &Arc<HeapState>) -> Arc<dyn HeapListener> {
        Arc::new(Noop)
    }

    fn heap(uri: &str) -> (Arc<MemoryHeap>, Arc<dyn Heap>) {
        let memory = Arc::new(MemoryHeap::new(uri));
        let dynamic: Arc<dyn Heap> = memory.clone();
        (memory, dynamic)
    }

    #[test]
    fn acquire_creates_once_and_registers_listener() {
        let registry = Registry::new();
        let (memory, heap) = heap("heapcast://a");
        let first = registry.acquire(&heap, &noop);
        let id = first.state().heap_id();
        drop(first);
        let second = registry.acquire(&heap, &noop);
        assert_eq!(second.state().heap_id(), id);
        assert_eq!(memory.listener_count(), 1);
        assert_eq!(registry.heap_count(), 1);
        assert_eq!(registry.uri_for(id), Some(HeapUri::from("heapcast://a")));
    }

    #[test]
    fn heap_ids_start_at_one_and_grow() {
        let registry = Registry::new();
        let (_, a) = heap("heapcast://a");
        let (_, b) = heap("heapcast://b");
        assert_eq!(registry.acquire(&a, &noop).state().heap_id(), HeapId(1));
        assert_eq!(registry.acquire(&b, &noop).state().heap_id(), HeapId(2));
    }

    #[test]
    fn removed_heap_is_recreated_with_new_id() {
        let registry = Registry::new();
        let (_, heap) = heap("heapcast://a");
        let mut lock = registry.acquire(&heap, &noop);
        let old = Arc::clone(lock.state());
        assert!(lock.registry(&registry).index.remove_heap(&old));
        lock.mark_terminated();
        drop(lock);
        assert!(registry.get(old.uri()).is_none());
        assert!(registry.uri_for(old.heap_id()).is_none());

        let fresh = registry.acquire(&heap, &noop);
        assert_ne!(fresh.state().heap_id(), old.heap_id());
        assert_ne!(fresh.state().instance_id(), old.instance_id());
    }

    #[test]
    fn stale_instance_is_not_unlinked() {
        let registry = Registry::new();
        let (_, heap) = heap("heapcast://a");
        let mut lock = registry.acquire(&heap, &noop);
        let old = Arc::clone(lock.state());
        let _ = lock.registry(&registry).index.remove_heap(&old);
        drop(lock);
        let mut fresh = registry.acquire(&heap, &noop);
        assert!(!fresh.registry(&registry).index.remove_heap(&old));
        assert_eq!(registry.heap_count(), 1);
    }

    #[test]
    fn waiter_recreates_heap_unlinked_while_it_waited() {
        let registry = Registry::new();
        let (_, heap) = heap("heapcast://a");
        let mut lock = registry.acquire(&heap, &noop);
        let old = Arc::clone(lock.state());

        let (heap_id, instance) = std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let lock = registry.acquire(&heap, &noop);
                (lock.state().heap_id(), lock.state().instance_id())
            });
            // Let the waiter block on the per-object lock first.
            std::thread::sleep(Duration::from_millis(50));
            assert!(lock.registry(&registry).index.remove_heap(&old));
            lock.mark_terminated();
            drop(lock);
            waiter.join().unwrap()
        });

        assert_ne!(heap_id, old.heap_id());
        assert!(instance > old.instance_id());
        assert_eq!(registry.heap_count(), 1);
        assert_eq!(registry.get(old.uri()).unwrap().instance_id(), instance);
    }

    #[test]
    fn waiter_retries_when_heap_was_replaced() {
        let registry = Registry::new();
        let (memory, heap) = heap("heapcast://a");
        let mut first = registry.acquire(&heap, &noop);
        let old = Arc::clone(first.state());

        let (replacement, seen) = std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let lock = registry.acquire(&heap, &noop);
                lock.state().instance_id()
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(first.registry(&registry).index.remove_heap(&old));
            first.mark_terminated();
            let second = registry.acquire(&heap, &noop);
            let replacement = second.state().instance_id();
            // The waiter wakes on the stale instance and must go round again.
            drop(first);
            std::thread::sleep(Duration::from_millis(50));
            drop(second);
            (replacement, waiter.join().unwrap())
        });

        assert_ne!(replacement, old.instance_id());
        assert_eq!(seen, replacement);
        assert_eq!(registry.heap_count(), 1);
        // Only the original and the replacement ever attached an adapter.
        assert_eq!(memory.listener_count(), 2);
    }

    #[test]
    fn interest_counts_drop_empty_entries() {
        let registry = Registry::new();
        let (_, heap) = heap("heapcast://a");
        let uri = HeapUri::from("heapcast://a");
        let session = SessionId::from("s1");
        let mut lock = registry.acquire(&heap, &noop);
        {
            let mut txn = lock.registry(&registry);
            txn.index.add_interest(&session, &uri);
            txn.index.add_interest(&session, &uri);
        }
        assert_eq!(registry.interest(&session, &uri), 2);
        assert_eq!(registry.heaps_for_session(&session).len(), 1);
        {
            let mut txn = lock.registry(&registry);
            txn.index.remove_interest(&session, &uri);
            assert_eq!(txn.index.interest(&session, &uri), 1);
            txn.index.remove_interest(&session, &uri);
        }
        drop(lock);
        assert_eq!(registry.interest(&session, &uri), 0);
        assert!(registry.session_heaps(&session).is_empty());
    }
}
