//! Point-in-time statistics for monitoring endpoints.

use chrono::{DateTime, Utc};
use heapcast_core::ids::{HeapId, HeapUri};
use serde::Serialize;

use super::state::HeapLock;

/// Snapshot of one live heap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapStats {
    /// Heap identity.
    pub uri: HeapUri,
    /// Numeric handle sent to clients.
    pub heap_id: HeapId,
    /// Incarnation of the state; changes whenever the heap is recreated.
    pub instance_id: u64,
    /// Live subscriptions.
    pub subscription_count: usize,
    /// Sessions holding at least one subscription.
    pub session_count: usize,
    /// Sessions whose initial state has been delivered.
    pub attached_sessions: usize,
    /// Last batch sequence number delivered.
    pub last_sequence: u64,
    /// Entries waiting in the change queue.
    pub queue_depth: usize,
    /// Whether the state has been torn down.
    pub terminated: bool,
    /// When the state was created.
    pub created_at: DateTime<Utc>,
}

impl HeapStats {
    pub(crate) fn capture(lock: &HeapLock) -> Self {
        let state = lock.state();
        Self {
            uri: state.uri().clone(),
            heap_id: state.heap_id(),
            instance_id: state.instance_id(),
            subscription_count: lock.subscriptions.len(),
            session_count: lock.session_subscriptions.len(),
            attached_sessions: lock.sessions.len(),
            last_sequence: lock.sequence,
            queue_depth: state.queue_depth(),
            terminated: state.is_terminated(),
            created_at: state.created_at(),
        }
    }
}
