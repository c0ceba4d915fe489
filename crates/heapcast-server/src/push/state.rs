//! Per-heap state and the per-object lock handle.
//!
//! Each published heap has one [`HeapState`] with two mutexes:
//!
//! - the **per-object lock** around [`HeapInner`] (subscribers, sequence),
//!   obtained as a [`HeapLock`]; held while flushing and while changing
//!   subscriptions;
//! - the **change queue** lock, a leaf lock taken briefly by the change adapter
//!   on the heap's mutation thread, by snapshot capture, and by drains.
//!
//! Nothing is ever acquired while the change queue lock is held.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use heapcast_core::heap::{Heap, HeapListener, Update};
use heapcast_core::ids::{HeapId, HeapUri, SessionId, SubscriptionId};
use heapcast_core::subscription::Subscription;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::transport::{LogExtension, SessionRef};

/// One entry of a heap's pending-change queue.
pub(crate) enum QueuedChange {
    /// An update to stream to every attached session.
    Delta(Update),
    /// A session to attach, with the snapshot it must see first.
    Join {
        session: SessionRef,
        snapshot: Update,
    },
    /// The heap reached end-of-life.
    Terminate,
}

/// Engine-side record of one subscription.
pub(crate) struct SubscriptionEntry {
    pub(crate) session: SessionRef,
    pub(crate) handle: Arc<Subscription>,
    pub(crate) log_extension: Option<LogExtension>,
}

/// State guarded by the per-object lock.
#[derive(Default)]
pub(crate) struct HeapInner {
    /// Sessions whose initial state has been delivered.
    pub(crate) sessions: HashMap<SessionId, SessionRef>,
    pub(crate) subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
    pub(crate) session_subscriptions: HashMap<SessionId, Vec<SubscriptionId>>,
    /// Last batch sequence number handed out.
    pub(crate) sequence: u64,
    /// The change adapter registered on the heap, until teardown.
    pub(crate) listener: Option<Arc<dyn HeapListener>>,
}

pub(crate) struct HeapState {
    uri: HeapUri,
    heap_id: HeapId,
    instance_id: u64,
    heap: Arc<dyn Heap>,
    inner: Arc<Mutex<HeapInner>>,
    queue: Mutex<VecDeque<QueuedChange>>,
    terminated: AtomicBool,
    created_at: DateTime<Utc>,
}

impl HeapState {
    pub(crate) fn new(heap_id: HeapId, instance_id: u64, heap: Arc<dyn Heap>) -> Arc<Self> {
        Arc::new(Self {
            uri: heap.uri().clone(),
            heap_id,
            instance_id,
            heap,
            inner: Arc::new(Mutex::new(HeapInner::default())),
            queue: Mutex::new(VecDeque::new()),
            terminated: AtomicBool::new(false),
            created_at: Utc::now(),
        })
    }

    pub(crate) fn uri(&self) -> &HeapUri {
        &self.uri
    }

    pub(crate) fn heap_id(&self) -> HeapId {
        self.heap_id
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub(crate) fn heap(&self) -> &Arc<dyn Heap> {
        &self.heap
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Take the per-object lock.
    pub(crate) fn lock(self: &Arc<Self>) -> HeapLock {
        HeapLock {
            guard: self.inner.lock_arc(),
            state: Arc::clone(self),
        }
    }

    /// One-way: once true, nothing more is queued or delivered.
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Append one entry. Returns `false` if the heap is already terminated.
    pub(crate) fn enqueue(&self, change: QueuedChange) -> bool {
        let mut queue = self.queue.lock();
        if self.is_terminated() {
            return false;
        }
        queue.push_back(change);
        true
    }

    /// Append an update, followed by a terminate marker if it is terminal.
    ///
    /// Both entries go in under one queue lock so nothing can slip between them.
    pub(crate) fn enqueue_update(&self, update: &Update) -> bool {
        let mut queue = self.queue.lock();
        if self.is_terminated() {
            return false;
        }
        queue.push_back(QueuedChange::Delta(update.clone()));
        if update.is_terminal() {
            queue.push_back(QueuedChange::Terminate);
        }
        true
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Proof that the per-object lock of one heap is held.
///
/// The global registry lock can only be opened through
/// [`HeapLock::registry`], which is what keeps the lock order fixed.
pub(crate) struct HeapLock {
    state: Arc<HeapState>,
    guard: ArcMutexGuard<RawMutex, HeapInner>,
}

impl HeapLock {
    pub(crate) fn state(&self) -> &Arc<HeapState> {
        &self.state
    }

    /// Take every pending entry; anything queued afterwards forms the next round.
    pub(crate) fn drain_queue(&mut self) -> VecDeque<QueuedChange> {
        std::mem::take(&mut *self.state.queue.lock())
    }

    /// Flip the terminated flag and discard whatever is still queued.
    pub(crate) fn mark_terminated(&mut self) {
        let mut queue = self.state.queue.lock();
        self.state.terminated.store(true, Ordering::Release);
        queue.clear();
    }
}

impl Deref for HeapLock {
    type Target = HeapInner;

    fn deref(&self) -> &HeapInner {
        &self.guard
    }
}

impl DerefMut for HeapLock {
    fn deref_mut(&mut self) -> &mut HeapInner {
        &mut self.guard
    }
}
