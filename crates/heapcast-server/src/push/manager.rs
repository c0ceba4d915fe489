//! Subscription lifecycle: the public face of the push engine.
//!
//! [`ConnectedObjectManager`] admits subscriptions, ends them for every cause,
//! tears heaps down when their last subscription goes, and owns the pusher pool.
//!
//! Publisher-side [`Subscription`] handles are closed only after every engine
//! lock has been released, because closing runs hooks that re-enter the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use heapcast_core::ids::{HeapId, HeapUri, SessionId, SubscriptionId};
use heapcast_core::protocol::{self, NewSubscription, PushMessage, TerminateRequest};
use heapcast_core::subscription::{CloseReason, ConnectedResponse, Subscription};
use heapcast_settings::PushSettings;
use metrics::counter;
use tracing::{debug, info, instrument, warn};

use super::adapter::{ChangeAdapter, Signals};
use super::audit;
use super::monitor::HeapStats;
use super::pool::PusherPool;
use super::registry::{Registry, RegistryTxn};
use super::state::{HeapLock, QueuedChange, SubscriptionEntry};
use crate::errors::SubscribeError;
use crate::metrics::{
    PUSH_SUBSCRIBE_REJECTED_TOTAL, PUSH_SUBSCRIPTIONS_CLOSED_TOTAL, PUSH_SUBSCRIPTIONS_OPENED_TOTAL,
};
use crate::transport::{LogExtension, OperationContext, SessionRef, TransportError};

/// Publisher handles to close once every engine lock is released.
pub(crate) type Closures = Vec<(Arc<Subscription>, CloseReason)>;

pub(crate) fn close_handles(closed: Closures) {
    for (handle, reason) in closed {
        let _ = handle.close(reason);
    }
}

/// Tuning for the push engine.
#[derive(Clone, Debug)]
pub struct PushConfig {
    /// Pusher worker tasks.
    pub worker_count: usize,
    /// Upper bound on actions per delta batch (single oversized updates excepted).
    pub max_actions_per_batch: usize,
    /// How long an idle worker waits before re-checking for shutdown.
    pub poll_interval: Duration,
}

impl From<&PushSettings> for PushConfig {
    fn from(settings: &PushSettings) -> Self {
        Self {
            worker_count: settings.worker_count.max(1),
            max_actions_per_batch: settings.max_actions_per_batch.max(1),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self::from(&PushSettings::default())
    }
}

/// State shared between the manager, the pusher workers and close hooks.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    pub(crate) max_actions_per_batch: usize,
    signals: Signals,
    shutting_down: AtomicBool,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// End one subscription on the heap at `uri`, if `session` still owns it.
    fn terminate(
        &self,
        uri: &HeapUri,
        session: &SessionId,
        subscription: &SubscriptionId,
        reason: CloseReason,
    ) -> bool {
        let Some(state) = self.registry.get(uri) else {
            return false;
        };
        let mut lock = state.lock();
        if lock.state().is_terminated() {
            return false;
        }
        let mut closed = Vec::new();
        let removed = self.remove_subscription(
            &mut lock,
            session,
            subscription,
            reason,
            reason.notifies_client(),
            &mut closed,
        );
        drop(lock);
        close_handles(closed);
        removed
    }

    /// Remove one subscription, detaching its session when it was the session's
    /// last one and tearing the heap down when it was the heap's last one.
    pub(crate) fn remove_subscription(
        &self,
        lock: &mut HeapLock,
        session: &SessionId,
        subscription: &SubscriptionId,
        reason: CloseReason,
        notify: bool,
        closed: &mut Closures,
    ) -> bool {
        let owned = lock
            .subscriptions
            .get(subscription)
            .is_some_and(|entry| entry.session.id() == session);
        if !owned {
            debug!(session_id = %session, subscription_id = %subscription, "subscription not found");
            return false;
        }
        let Some(entry) = lock.subscriptions.remove(subscription) else {
            return false;
        };
        let state = Arc::clone(lock.state());

        {
            let mut txn = lock.registry(&self.registry);
            let session_done = match txn.heap.session_subscriptions.get_mut(session) {
                Some(ids) => {
                    ids.retain(|id| id != subscription);
                    ids.is_empty()
                }
                None => true,
            };
            if session_done {
                let _ = txn.heap.session_subscriptions.remove(session);
                let _ = txn.heap.sessions.remove(session);
            }
            txn.index.remove_interest(session, state.uri());
            if notify {
                notify_terminated(state.heap_id(), subscription, &entry, reason);
            }
            record_close(state.uri(), subscription, &entry, reason);
            closed.push((Arc::clone(&entry.handle), reason));

            if txn.heap.subscriptions.is_empty() {
                Self::teardown_locked(&mut txn, reason, closed);
            }
        }
        true
    }

    /// Drop every subscription `session` holds on this heap, without notifying it.
    pub(crate) fn drop_session(&self, lock: &mut HeapLock, session: &SessionId, closed: &mut Closures) {
        let ids = lock
            .session_subscriptions
            .get(session)
            .cloned()
            .unwrap_or_default();
        for id in ids {
            let _ = self.remove_subscription(
                lock,
                session,
                &id,
                CloseReason::ConnectionClosed,
                false,
                closed,
            );
        }
        let _ = lock.sessions.remove(session);
    }

    pub(crate) fn teardown(&self, lock: &mut HeapLock, reason: CloseReason, closed: &mut Closures) {
        let mut txn = lock.registry(&self.registry);
        Self::teardown_locked(&mut txn, reason, closed);
    }

    /// Terminate the heap: unlink it, end every remaining subscription and
    /// detach the change adapter. Idempotent.
    fn teardown_locked(txn: &mut RegistryTxn<'_>, reason: CloseReason, closed: &mut Closures) {
        let state = Arc::clone(txn.heap.state());
        if state.is_terminated() {
            return;
        }
        let _ = txn.index.remove_heap(&state);

        let remaining: Vec<_> = txn.heap.subscriptions.drain().collect();
        for (id, entry) in &remaining {
            txn.index.remove_interest(entry.session.id(), state.uri());
            if reason.notifies_client() {
                notify_terminated(state.heap_id(), id, entry, reason);
            }
            record_close(state.uri(), id, entry, reason);
        }
        closed.extend(
            remaining
                .into_iter()
                .map(|(_, entry)| (entry.handle, reason)),
        );
        txn.heap.sessions.clear();
        txn.heap.session_subscriptions.clear();

        if let Some(listener) = txn.heap.listener.take() {
            state.heap().remove_listener(&listener);
        }
        txn.heap.mark_terminated();
        info!(
            uri = %state.uri(),
            heap_id = %state.heap_id(),
            reason = reason.as_str(),
            "heap torn down"
        );
    }
}

fn record_close(uri: &HeapUri, id: &SubscriptionId, entry: &SubscriptionEntry, reason: CloseReason) {
    counter!(PUSH_SUBSCRIPTIONS_CLOSED_TOTAL, "reason" => reason.as_str()).increment(1);
    audit::closed(entry.session.id(), uri, id, reason, entry.log_extension.as_ref());
}

fn notify_terminated(
    heap_id: HeapId,
    subscription: &SubscriptionId,
    entry: &SubscriptionEntry,
    reason: CloseReason,
) {
    let message = PushMessage::Terminate {
        heap_id,
        subscription_id: subscription.clone(),
        reason,
    };
    let result = protocol::encode(&message, entry.session.protocol_version())
        .map_err(TransportError::from)
        .and_then(|frame| entry.session.write(frame));
    if let Err(error) = result {
        debug!(
            session_id = %entry.session.id(),
            subscription_id = %subscription,
            %error,
            "termination notice not delivered"
        );
    }
}

fn rejection_reason(error: &SubscribeError) -> CloseReason {
    if matches!(error, SubscribeError::Shutdown) {
        CloseReason::NodeShutdown
    } else {
        CloseReason::RequestedByPublisher
    }
}

/// Answer a subscribe request that will not become live.
fn reject(
    session: &SessionRef,
    uri: &HeapUri,
    ctx: &dyn OperationContext,
    response: &ConnectedResponse,
    error: SubscribeError,
    log_extension: Option<&LogExtension>,
) -> SubscribeError {
    counter!(PUSH_SUBSCRIBE_REJECTED_TOTAL, "code" => error.code()).increment(1);
    audit::rejected(session.id(), uri, error.code(), log_extension);
    let _ = response.subscription.close(rejection_reason(&error));
    if let Err(reply) = ctx.respond(Err(&error)) {
        debug!(error = %reply, "rejection reply not delivered");
    }
    error
}

/// The connected-object push engine.
///
/// Must be created inside a Tokio runtime; the pusher workers are spawned on it.
pub struct ConnectedObjectManager {
    shared: Arc<Shared>,
    pool: PusherPool,
}

impl ConnectedObjectManager {
    /// Start the engine and its pusher workers.
    pub fn start(config: &PushConfig) -> Self {
        let (signals, rx) = Signals::channel();
        let shared = Arc::new(Shared {
            registry: Registry::new(),
            max_actions_per_batch: config.max_actions_per_batch.max(1),
            signals,
            shutting_down: AtomicBool::new(false),
        });
        let pool = PusherPool::start(
            &shared,
            rx,
            config.worker_count.max(1),
            config.poll_interval,
        );
        info!(
            workers = config.worker_count,
            max_actions = config.max_actions_per_batch,
            "push engine started"
        );
        Self { shared, pool }
    }

    /// Admit a subscription from `session` to the heap in `response`.
    ///
    /// The reply (success or error) is sent through `ctx` before this returns.
    /// On success the session is queued to receive the heap's full state, unless
    /// it already holds another subscription to the same heap.
    #[instrument(skip_all, fields(session_id = %session.id(), uri = %response.heap.uri()))]
    pub fn add_subscription(
        &self,
        session: &SessionRef,
        response: ConnectedResponse,
        ctx: &dyn OperationContext,
        log_extension: Option<LogExtension>,
    ) -> Result<NewSubscription, SubscribeError> {
        let shared = &self.shared;
        let uri = response.heap.uri().clone();
        if shared.is_shutting_down() {
            return Err(reject(
                session,
                &uri,
                ctx,
                &response,
                SubscribeError::Shutdown,
                log_extension.as_ref(),
            ));
        }

        let signals = shared.signals.clone();
        let mut lock = shared
            .registry
            .acquire(&response.heap, &|state| ChangeAdapter::new(state, signals.clone()));
        let heap_id = lock.state().heap_id();

        let error = if shared.is_shutting_down() {
            Some(SubscribeError::Shutdown)
        } else {
            None
        };

        // Identity is disclosed once per continuous span of interest.
        let first_for_session =
            lock.registry(&shared.registry).index.interest(session.id(), &uri) == 0;

        let mut terminal = false;
        if error.is_none() {
            let state = Arc::clone(lock.state());
            response.heap.traverse(&mut |snapshot| {
                if snapshot.is_terminal() {
                    terminal = true;
                } else if first_for_session {
                    // The heap is quiescent during traversal, so the join lands
                    // exactly between the updates the snapshot does and does not reflect.
                    let _ = state.enqueue(QueuedChange::Join {
                        session: Arc::clone(session),
                        snapshot: snapshot.clone(),
                    });
                }
            });
        }
        let error = error.or_else(|| terminal.then(|| SubscribeError::HeapTerminated(uri.clone())));

        if let Some(error) = error {
            let mut closed = Vec::new();
            if lock.subscriptions.is_empty() {
                shared.teardown(&mut lock, rejection_reason(&error), &mut closed);
            }
            drop(lock);
            close_handles(closed);
            return Err(reject(session, &uri, ctx, &response, error, log_extension.as_ref()));
        }

        let subscription_id = SubscriptionId::new();
        {
            let mut txn = lock.registry(&shared.registry);
            let _ = txn.heap.subscriptions.insert(
                subscription_id.clone(),
                SubscriptionEntry {
                    session: Arc::clone(session),
                    handle: Arc::clone(&response.subscription),
                    log_extension: log_extension.clone(),
                },
            );
            txn.heap
                .session_subscriptions
                .entry(session.id().clone())
                .or_default()
                .push(subscription_id.clone());
            txn.index.add_interest(session.id(), &uri);
        }

        let reply = NewSubscription {
            subscription_id: subscription_id.clone(),
            heap_id,
            uri: first_for_session.then(|| uri.clone()),
        };
        // Replied under the per-object lock so the initial state cannot overtake it.
        if let Err(error) = ctx.respond(Ok(&reply)) {
            warn!(%error, "subscription reply failed, rolling back");
            let mut closed = Vec::new();
            let _ = shared.remove_subscription(
                &mut lock,
                session.id(),
                &subscription_id,
                CloseReason::InternalError,
                false,
                &mut closed,
            );
            drop(lock);
            close_handles(closed);
            return Err(SubscribeError::Reply(error));
        }

        counter!(PUSH_SUBSCRIPTIONS_OPENED_TOTAL).increment(1);
        audit::subscribed(session.id(), &uri, heap_id, &subscription_id, log_extension.as_ref());
        if first_for_session {
            shared.signals.notify(&uri);
        }
        drop(lock);

        let hook = Arc::downgrade(&self.shared);
        let hook_session = session.id().clone();
        let hook_subscription = subscription_id;
        response.subscription.on_close(move |reason| {
            if let Some(shared) = hook.upgrade() {
                let _ = shared.terminate(&uri, &hook_session, &hook_subscription, reason);
            }
        });
        Ok(reply)
    }

    /// End one subscription at the client's request.
    ///
    /// Returns `false` if the subscription is unknown or not owned by `session`.
    pub fn terminate_subscription(&self, session: &SessionId, request: &TerminateRequest) -> bool {
        let Some(uri) = self.shared.registry.uri_for(request.heap_id) else {
            debug!(heap_id = %request.heap_id, "terminate for unknown heap");
            return false;
        };
        self.shared
            .terminate(&uri, session, &request.subscription_id, request.reason)
    }

    /// Drop everything a closed connection held. Nothing is sent to it.
    pub fn session_closed(&self, session: &SessionId) {
        let heaps = self.shared.registry.heaps_for_session(session);
        let mut closed = Vec::new();
        for state in heaps {
            let mut lock = state.lock();
            if lock.state().is_terminated() {
                continue;
            }
            self.shared.drop_session(&mut lock, session, &mut closed);
        }
        let count = closed.len();
        close_handles(closed);
        if count > 0 {
            debug!(session_id = %session, subscriptions = count, "session cleaned up");
        }
    }

    /// Tear down the heap at `uri`, ending every subscription with `reason`.
    pub fn terminate_heap(&self, uri: &HeapUri, reason: CloseReason) -> bool {
        let Some(state) = self.shared.registry.get(uri) else {
            return false;
        };
        let mut lock = state.lock();
        if lock.state().is_terminated() {
            return false;
        }
        let mut closed = Vec::new();
        self.shared.teardown(&mut lock, reason, &mut closed);
        drop(lock);
        close_handles(closed);
        true
    }

    /// Reject new subscriptions, end every live one and stop the workers.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let mut closed = Vec::new();
        let heaps = self.shared.registry.heaps();
        let count = heaps.len();
        for state in heaps {
            let mut lock = state.lock();
            self.shared
                .teardown(&mut lock, CloseReason::NodeShutdown, &mut closed);
        }
        close_handles(closed);
        self.pool.stop().await;
        info!(heaps = count, "push engine stopped");
    }

    /// Live heaps.
    pub fn heap_count(&self) -> usize {
        self.shared.registry.heap_count()
    }

    /// Statistics for the live heap at `uri`.
    pub fn heap_stats(&self, uri: &HeapUri) -> Option<HeapStats> {
        let state = self.shared.registry.get(uri)?;
        let lock = state.lock();
        Some(HeapStats::capture(&lock))
    }

    /// Statistics for every live heap, ordered by heap id.
    pub fn list_heaps(&self) -> Vec<HeapStats> {
        let mut stats: Vec<HeapStats> = self
            .shared
            .registry
            .heaps()
            .into_iter()
            .map(|state| HeapStats::capture(&state.lock()))
            .filter(|stats| !stats.terminated)
            .collect();
        stats.sort_by_key(|s| s.heap_id);
        stats
    }

    /// Heaps `session` currently holds subscriptions on.
    pub fn session_heaps(&self, session: &SessionId) -> Vec<HeapUri> {
        self.shared.registry.session_heaps(session)
    }

    /// Live subscriptions `session` holds on `uri`.
    pub fn subscription_count(&self, session: &SessionId, uri: &HeapUri) -> usize {
        self.shared.registry.interest(session, uri)
    }
}

impl Drop for ConnectedObjectManager {
    fn drop(&mut self) {
        self.pool.cancel();
    }
}
