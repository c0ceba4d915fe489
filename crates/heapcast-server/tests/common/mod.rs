//! Shared fixtures for push engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use heapcast_core::heap::UpdateAction;
use heapcast_core::ids::SessionId;
use heapcast_core::protocol::{self, NewSubscription, ProtocolVersion, PushMessage};
use heapcast_server::{
    ConnectedObjectManager, OperationContext, PushConfig, Session, SessionRef, SubscribeError,
    TransportError,
};
use parking_lot::Mutex;

/// In-memory session that records every frame it is handed.
pub struct RecordingSession {
    id: SessionId,
    version: ProtocolVersion,
    frames: Mutex<Vec<Bytes>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    panic_next: AtomicBool,
    writes: AtomicUsize,
}

impl RecordingSession {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_version(id, ProtocolVersion::V1)
    }

    pub fn with_version(id: &str, version: ProtocolVersion) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::from(id),
            version,
            frames: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            panic_next: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn session(self: &Arc<Self>) -> SessionRef {
        self.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next write panic, as a misbehaving transport would.
    pub fn panic_on_next_write(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    /// Whether the engine asked for the connection to be closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write attempts, including failed ones.
    pub fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    pub fn messages(&self) -> Vec<PushMessage> {
        self.frames()
            .iter()
            .map(|frame| protocol::decode(frame, self.version).unwrap())
            .collect()
    }

    /// Delta messages as (sequence, initial, actions).
    pub fn deltas(&self) -> Vec<(u64, bool, Vec<UpdateAction>)> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                PushMessage::Delta {
                    sequence,
                    initial,
                    actions,
                    ..
                } => Some((sequence, initial, actions)),
                _ => None,
            })
            .collect()
    }

    pub fn terminations(&self) -> Vec<PushMessage> {
        self.messages()
            .into_iter()
            .filter(|message| matches!(message, PushMessage::Terminate { .. }))
            .collect()
    }
}

impl Session for RecordingSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        let _ = self.writes.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("transport exploded");
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::QueueFull { capacity: 0 });
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Operation context that records replies.
#[derive(Default)]
pub struct RecordingContext {
    replies: Mutex<Vec<Result<NewSubscription, String>>>,
    fail: AtomicBool,
}

impl RecordingContext {
    pub fn failing() -> Self {
        let ctx = Self::default();
        ctx.fail.store(true, Ordering::SeqCst);
        ctx
    }

    pub fn replies(&self) -> Vec<Result<NewSubscription, String>> {
        self.replies.lock().clone()
    }
}

impl OperationContext for RecordingContext {
    fn operation(&self) -> &str {
        "subscribe"
    }

    fn respond(&self, outcome: Result<&NewSubscription, &SubscribeError>) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.replies
            .lock()
            .push(outcome.cloned().map_err(|e| e.code().to_string()));
        Ok(())
    }
}

pub fn config(max_actions_per_batch: usize) -> PushConfig {
    PushConfig {
        worker_count: 2,
        max_actions_per_batch,
        poll_interval: Duration::from_millis(20),
    }
}

pub fn manager() -> ConnectedObjectManager {
    ConnectedObjectManager::start(&config(10))
}

/// Poll `condition` until it holds; panics after five seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let the workers run for a moment so that anything queued gets flushed.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Scalar values set by `SetScalar` actions on `node`, in order.
pub fn scalar_values(actions: &[UpdateAction], node: u32) -> Vec<i64> {
    actions
        .iter()
        .filter_map(|action| match action {
            UpdateAction::SetScalar { node: n, value } if *n == node => value.as_i64(),
            _ => None,
        })
        .collect()
}
