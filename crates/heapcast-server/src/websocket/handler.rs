//! Client request dispatch: subscribe and unsubscribe.

use std::collections::BTreeMap;
use std::sync::Arc;

use heapcast_core::ids::{HeapId, HeapUri, SubscriptionId};
use heapcast_core::protocol::{NewSubscription, TerminateRequest};
use heapcast_core::subscription::CloseReason;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::connection::ClientConnection;
use super::server::AppState;
use crate::errors::SubscribeError;
use crate::transport::{LogExtension, OperationContext, Session, SessionRef, TransportError};

/// Client → server request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Open a subscription to a published heap.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Echoed in the reply.
        request_id: u64,
        /// Heap to subscribe to.
        uri: HeapUri,
        /// Extra fields for the audit log.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        tags: BTreeMap<String, String>,
    },
    /// End a subscription.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// Heap handle from the subscribe reply.
        heap_id: HeapId,
        /// Subscription to end.
        subscription_id: SubscriptionId,
    },
}

/// Server → client reply to a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerReply {
    /// The subscription is live; its initial state follows.
    #[serde(rename_all = "camelCase")]
    Subscribed {
        /// Request this answers.
        request_id: u64,
        /// Subscription details.
        #[serde(flatten)]
        subscription: NewSubscription,
    },
    /// The request failed.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Request this answers, when it could be parsed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Stable error code.
        code: String,
        /// Human-readable detail.
        message: String,
    },
}

impl ServerReply {
    fn error(request_id: Option<u64>, code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            request_id,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn send(connection: &ClientConnection, reply: &ServerReply) -> Result<(), TransportError> {
    let json = serde_json::to_string(reply).map_err(|e| TransportError::Codec(e.into()))?;
    connection.send_reply(json)
}

/// Operation context for one subscribe request on a WebSocket connection.
pub struct WsOperationContext<'a> {
    connection: &'a ClientConnection,
    request_id: u64,
}

impl<'a> WsOperationContext<'a> {
    /// Context answering `request_id` on `connection`.
    pub fn new(connection: &'a ClientConnection, request_id: u64) -> Self {
        Self {
            connection,
            request_id,
        }
    }
}

impl OperationContext for WsOperationContext<'_> {
    fn operation(&self) -> &str {
        "subscribe"
    }

    fn respond(&self, outcome: Result<&NewSubscription, &SubscribeError>) -> Result<(), TransportError> {
        let reply = match outcome {
            Ok(subscription) => ServerReply::Subscribed {
                request_id: self.request_id,
                subscription: subscription.clone(),
            },
            Err(error) => ServerReply::error(Some(self.request_id), error.code(), error.to_string()),
        };
        send(self.connection, &reply)
    }
}

/// Parse and dispatch one text message from a client.
#[instrument(skip_all, fields(session_id = %connection.id()))]
pub fn handle_message(raw: &str, connection: &Arc<ClientConnection>, state: &AppState) {
    let message: ClientMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "invalid client message");
            let reply = ServerReply::error(None, "INVALID_REQUEST", format!("invalid message: {error}"));
            if let Err(error) = send(connection, &reply) {
                debug!(%error, "error reply not delivered");
            }
            return;
        }
    };

    match message {
        ClientMessage::Subscribe {
            request_id,
            uri,
            tags,
        } => subscribe(connection, state, request_id, &uri, tags),
        ClientMessage::Unsubscribe {
            heap_id,
            subscription_id,
        } => {
            let request = TerminateRequest {
                heap_id,
                subscription_id,
                reason: CloseReason::RequestedByClient,
            };
            let removed = state
                .manager
                .terminate_subscription(connection.id(), &request);
            debug!(heap_id = %heap_id, removed, "unsubscribe handled");
        }
    }
}

fn subscribe(
    connection: &Arc<ClientConnection>,
    state: &AppState,
    request_id: u64,
    uri: &HeapUri,
    tags: BTreeMap<String, String>,
) {
    let ctx = WsOperationContext::new(connection, request_id);
    let Some(response) = state.catalog.connect(uri) else {
        let error = SubscribeError::UnknownHeap(uri.clone());
        debug!(uri = %uri, "subscribe to unpublished heap");
        if let Err(reply) = ctx.respond(Err(&error)) {
            debug!(error = %reply, "error reply not delivered");
        }
        return;
    };
    let log_extension = (!tags.is_empty()).then(|| {
        tags.into_iter()
            .fold(LogExtension::new(), |ext, (key, value)| ext.with(key, value))
    });
    let session: SessionRef = connection.clone();
    if let Err(error) = state
        .manager
        .add_subscription(&session, response, &ctx, log_extension)
    {
        debug!(uri = %uri, %error, "subscribe rejected");
    }
}
