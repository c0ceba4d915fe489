//! Pusher pool: workers that drain change queues and deliver batches.
//!
//! Each signal names a heap with pending changes. A worker runs one flush at a
//! time on Tokio's blocking pool, so at most `worker_count` flushes are in
//! flight. A flush takes the heap's per-object lock, drains its queue once and
//! walks the entries in order: joins attach a session with its snapshot, runs
//! of deltas are batched and fanned out, and a terminate marker tears the heap
//! down. Anything queued during delivery arrives with its own signal and forms
//! the next round.
//!
//! A session whose write fails loses every subscription on that heap and is
//! closed. Other delivery errors and panics never escape a worker; they tear
//! the offending heap down with [`CloseReason::InternalError`].

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use heapcast_core::errors::CodecError;
use heapcast_core::heap::Update;
use heapcast_core::ids::HeapUri;
use heapcast_core::protocol::{self, ProtocolVersion, PushMessage};
use heapcast_core::subscription::CloseReason;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::batch;
use super::manager::{Closures, Shared, close_handles};
use super::state::{HeapLock, QueuedChange};
use crate::metrics::{
    PUSH_BATCHES_TOTAL, PUSH_ENCODES_TOTAL, PUSH_FLUSH_ERRORS_TOTAL, PUSH_FRAMES_TOTAL,
    PUSH_WRITE_FAILURES_TOTAL,
};
use crate::transport::SessionRef;

type Receiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<HeapUri>>>;

pub(crate) struct PusherPool {
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PusherPool {
    pub(crate) fn start(
        shared: &Arc<Shared>,
        rx: mpsc::UnboundedReceiver<HeapUri>,
        worker_count: usize,
        poll_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let rx: Receiver = Arc::new(AsyncMutex::new(rx));
        let workers = (0..worker_count)
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    Arc::clone(shared),
                    Arc::clone(&rx),
                    cancel.clone(),
                    poll_interval,
                ))
            })
            .collect();
        Self {
            cancel,
            workers: Mutex::new(workers),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel every worker and wait for it to finish its current flush.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "pusher worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    index: usize,
    shared: Arc<Shared>,
    rx: Receiver,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    debug!(worker = index, "pusher worker started");
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = async {
                let mut rx = rx.lock().await;
                tokio::time::timeout(poll_interval, rx.recv()).await
            } => next,
        };
        match next {
            Ok(Some(uri)) => {
                // Flushing takes blocking locks and writes synchronously, so it
                // runs off the async workers that drive the sockets.
                let shared = Arc::clone(&shared);
                if let Err(error) =
                    tokio::task::spawn_blocking(move || flush(&shared, &uri)).await
                {
                    warn!(worker = index, %error, "flush task failed");
                }
            }
            Ok(None) => break,
            // Idle; go round to observe cancellation.
            Err(_) => {}
        }
    }
    debug!(worker = index, "pusher worker stopped");
}

/// Deliver everything currently queued for the heap at `uri`.
pub(crate) fn flush(shared: &Shared, uri: &HeapUri) {
    let Some(state) = shared.registry.get(uri) else {
        trace!(uri = %uri, "signal for departed heap");
        return;
    };
    let mut lock = state.lock();
    if lock.state().is_terminated() {
        return;
    }
    let mut work = lock.drain_queue();
    if work.is_empty() {
        return;
    }

    let mut closed = Vec::new();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        deliver(shared, &mut lock, &mut work, &mut closed)
    }));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(error.to_string()),
        Err(payload) => Some(panic_message(payload.as_ref())),
    };
    if let Some(failure) = failure {
        counter!(PUSH_FLUSH_ERRORS_TOTAL).increment(1);
        error!(uri = %uri, error = %failure, "delivery failed, terminating heap");
        shared.teardown(&mut lock, CloseReason::InternalError, &mut closed);
    }
    drop(lock);
    close_handles(closed);
}

fn deliver(
    shared: &Shared,
    lock: &mut HeapLock,
    work: &mut VecDeque<QueuedChange>,
    closed: &mut Closures,
) -> Result<(), CodecError> {
    while let Some(change) = work.pop_front() {
        match change {
            QueuedChange::Join { session, snapshot } => {
                attach(shared, lock, session, snapshot, closed)?;
            }
            QueuedChange::Delta(first) => {
                let mut run = vec![first];
                while let Some(QueuedChange::Delta(_)) = work.front() {
                    if let Some(QueuedChange::Delta(update)) = work.pop_front() {
                        run.push(update);
                    }
                }
                send_updates(shared, lock, run, closed)?;
            }
            QueuedChange::Terminate => {
                shared.teardown(lock, CloseReason::RequestedByPublisher, closed);
            }
        }
        if lock.state().is_terminated() {
            break;
        }
    }
    Ok(())
}

/// Send a joining session the heap's full state and start streaming to it.
fn attach(
    shared: &Shared,
    lock: &mut HeapLock,
    session: SessionRef,
    snapshot: Update,
    closed: &mut Closures,
) -> Result<(), CodecError> {
    let id = session.id().clone();
    if !lock.session_subscriptions.contains_key(&id) {
        debug!(session_id = %id, "session left before its initial state was sent");
        return Ok(());
    }
    if lock.sessions.contains_key(&id) {
        // An earlier join already gave this session a consistent view.
        return Ok(());
    }
    let message = PushMessage::Delta {
        heap_id: lock.state().heap_id(),
        sequence: lock.sequence,
        initial: true,
        actions: snapshot.actions,
    };
    let version = session.protocol_version();
    let frame = protocol::encode(&message, version)?;
    counter!(PUSH_ENCODES_TOTAL, "version" => version_label(version)).increment(1);
    match session.write(frame) {
        Ok(()) => {
            counter!(PUSH_FRAMES_TOTAL).increment(1);
            let _ = lock.sessions.insert(id, session);
        }
        Err(error) => {
            counter!(PUSH_WRITE_FAILURES_TOTAL).increment(1);
            warn!(session_id = %id, %error, "initial state not delivered, dropping session");
            shared.drop_session(lock, &id, closed);
            session.close();
        }
    }
    Ok(())
}

/// Batch a run of updates and send each batch to every attached session.
fn send_updates(
    shared: &Shared,
    lock: &mut HeapLock,
    updates: Vec<Update>,
    closed: &mut Closures,
) -> Result<(), CodecError> {
    let heap_id = lock.state().heap_id();
    for batch in batch::partition(updates, shared.max_actions_per_batch) {
        lock.sequence += 1;
        let message = PushMessage::Delta {
            heap_id,
            sequence: lock.sequence,
            initial: false,
            actions: batch.into_iter().flat_map(|u| u.actions).collect(),
        };

        let mut frames: HashMap<ProtocolVersion, Bytes> = HashMap::new();
        let mut failed = Vec::new();
        let mut sent = 0_u64;
        for session in lock.sessions.values() {
            let version = session.protocol_version();
            let frame = match frames.entry(version) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    counter!(PUSH_ENCODES_TOTAL, "version" => version_label(version)).increment(1);
                    entry.insert(protocol::encode(&message, version)?).clone()
                }
            };
            match session.write(frame) {
                Ok(()) => sent += 1,
                Err(error) => {
                    warn!(session_id = %session.id(), %error, "delta not delivered, dropping session");
                    failed.push(Arc::clone(session));
                }
            }
        }
        counter!(PUSH_BATCHES_TOTAL).increment(1);
        counter!(PUSH_FRAMES_TOTAL).increment(sent);
        trace!(heap_id = %heap_id, sequence = lock.sequence, sessions = sent, "batch delivered");

        if !failed.is_empty() {
            counter!(PUSH_WRITE_FAILURES_TOTAL).increment(failed.len() as u64);
            // The client cannot recover from a gap in its stream, so the
            // connection is closed and its own cleanup releases the rest.
            for session in failed {
                shared.drop_session(lock, session.id(), closed);
                session.close();
            }
            if lock.state().is_terminated() {
                break;
            }
        }
    }
    Ok(())
}

fn version_label(version: ProtocolVersion) -> &'static str {
    match version {
        ProtocolVersion::V1 => "v1",
        ProtocolVersion::V2 => "v2",
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic during delivery".to_string()
    }
}
