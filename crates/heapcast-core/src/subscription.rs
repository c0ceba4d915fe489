//! Publisher-side subscription handle and close reasons.
//!
//! A publisher answers a connect request with a [`ConnectedResponse`]: the heap to
//! stream plus a fresh [`Subscription`]. Either side may end the subscription:
//!
//! - the engine closes the handle with whatever cause ended it (client
//!   unsubscribe, disconnect, heap teardown, ...), so the publisher sees every
//!   termination through [`Subscription::on_close`];
//! - the publisher may call [`Subscription::close`] itself, which the engine
//!   observes through its own hook and turns into a client-visible termination.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::heap::Heap;

/// Why a subscription (or a whole heap) ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client unsubscribed.
    RequestedByClient,
    /// The publisher closed the subscription or terminated the heap.
    RequestedByPublisher,
    /// An operator closed it on the subscribing node.
    RequestedBySubscriberAdministrator,
    /// An operator closed it on the publishing node.
    RequestedByPublisherAdministrator,
    /// The client's connection went away.
    ConnectionClosed,
    /// The serving node is shutting down.
    NodeShutdown,
    /// Delivery failed inside the engine.
    InternalError,
}

impl CloseReason {
    /// Whether the client must be told about a termination with this cause.
    ///
    /// Client-initiated closures are not echoed back, and a lost connection
    /// has nobody left to tell.
    pub fn notifies_client(self) -> bool {
        !matches!(self, Self::RequestedByClient | Self::ConnectionClosed)
    }

    /// Stable snake-case code, used as a metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestedByClient => "requested_by_client",
            Self::RequestedByPublisher => "requested_by_publisher",
            Self::RequestedBySubscriberAdministrator => "requested_by_subscriber_administrator",
            Self::RequestedByPublisherAdministrator => "requested_by_publisher_administrator",
            Self::ConnectionClosed => "connection_closed",
            Self::NodeShutdown => "node_shutdown",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().replace('_', " "))
    }
}

type CloseHook = Box<dyn FnOnce(CloseReason) + Send>;

#[derive(Default)]
struct SubscriptionState {
    reason: Option<CloseReason>,
    hooks: Vec<CloseHook>,
}

/// One subscriber's interest in a heap, as seen by the publisher.
#[derive(Default)]
pub struct Subscription {
    state: Mutex<SubscriptionState>,
}

impl Subscription {
    /// Create an open subscription.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Close with `reason`. The first close wins; returns whether this call closed it.
    ///
    /// Hooks run on the calling thread after the internal lock is released.
    pub fn close(&self, reason: CloseReason) -> bool {
        let hooks = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason);
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook(reason);
        }
        true
    }

    /// The reason this subscription was closed with, if closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().reason
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Run `hook` once when the subscription closes; immediately if already closed.
    pub fn on_close(&self, hook: impl FnOnce(CloseReason) + Send + 'static) {
        let reason = {
            let mut state = self.state.lock();
            match state.reason {
                Some(reason) => reason,
                None => {
                    state.hooks.push(Box::new(hook));
                    return;
                }
            }
        };
        hook(reason);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}

/// The result of a successful connect operation, consumed by the engine.
#[derive(Clone)]
pub struct ConnectedResponse {
    /// The heap to stream.
    pub heap: Arc<dyn Heap>,
    /// The publisher's handle for this subscription.
    pub subscription: Arc<Subscription>,
}

impl ConnectedResponse {
    /// Pair a heap with a subscription handle.
    pub fn new(heap: Arc<dyn Heap>, subscription: Arc<Subscription>) -> Self {
        Self { heap, subscription }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn first_close_wins() {
        let sub = Subscription::new();
        assert!(sub.close(CloseReason::RequestedByPublisher));
        assert!(!sub.close(CloseReason::InternalError));
        assert_eq!(sub.close_reason(), Some(CloseReason::RequestedByPublisher));
    }

    #[test]
    fn hooks_fire_once() {
        let sub = Subscription::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        sub.on_close(move |reason| {
            assert_eq!(reason, CloseReason::ConnectionClosed);
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        let _ = sub.close(CloseReason::ConnectionClosed);
        let _ = sub.close(CloseReason::ConnectionClosed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_on_closed_subscription_fires_immediately() {
        let sub = Subscription::new();
        let _ = sub.close(CloseReason::NodeShutdown);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        sub.on_close(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_may_reenter_subscription() {
        let sub = Subscription::new();
        let inner = Arc::clone(&sub);
        sub.on_close(move |_| {
            // The lock is released before hooks run.
            assert!(inner.is_closed());
        });
        assert!(sub.close(CloseReason::RequestedByClient));
    }

    #[test]
    fn notification_policy() {
        assert!(!CloseReason::RequestedByClient.notifies_client());
        assert!(!CloseReason::ConnectionClosed.notifies_client());
        assert!(CloseReason::RequestedByPublisher.notifies_client());
        assert!(CloseReason::RequestedByPublisherAdministrator.notifies_client());
        assert!(CloseReason::NodeShutdown.notifies_client());
        assert!(CloseReason::InternalError.notifies_client());
    }

    #[test]
    fn reason_display_is_human_readable() {
        assert_eq!(
            CloseReason::RequestedByPublisher.to_string(),
            "requested by publisher"
        );
    }
}
