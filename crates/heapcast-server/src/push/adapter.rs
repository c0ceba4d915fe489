//! Change adapter: the listener the engine registers on every live heap.
//!
//! Runs on the heap's mutating thread while the heap holds its own lock, so it
//! only touches the state's change queue (a leaf lock) and the scheduler
//! channel. It never takes the per-object or global lock.

use std::sync::{Arc, Weak};

use heapcast_core::heap::{HeapListener, Update};
use heapcast_core::ids::HeapUri;
use tokio::sync::mpsc;
use tracing::trace;

use super::state::HeapState;

/// Scheduler handle: "this heap has pending changes".
#[derive(Clone)]
pub(crate) struct Signals {
    tx: mpsc::UnboundedSender<HeapUri>,
}

impl Signals {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<HeapUri>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn notify(&self, uri: &HeapUri) {
        if self.tx.send(uri.clone()).is_err() {
            trace!(uri = %uri, "pusher pool gone, dropping signal");
        }
    }
}

pub(crate) struct ChangeAdapter {
    state: Weak<HeapState>,
    signals: Signals,
}

impl ChangeAdapter {
    pub(crate) fn new(state: &Arc<HeapState>, signals: Signals) -> Arc<dyn HeapListener> {
        Arc::new(Self {
            state: Arc::downgrade(state),
            signals,
        })
    }
}

impl HeapListener for ChangeAdapter {
    fn apply_update(&self, update: &Update) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        if !state.enqueue_update(update) {
            trace!(uri = %state.uri(), "update for terminated heap dropped");
            return;
        }
        self.signals.notify(state.uri());
    }
}
