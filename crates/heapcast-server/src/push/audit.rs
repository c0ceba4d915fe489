//! Connected-object audit log lines.
//!
//! Emitted under [`CONNECTED_OBJECTS_TARGET`] so operators can route
//! subscription lifecycle events separately from engine diagnostics.

use heapcast_core::ids::{HeapId, HeapUri, SessionId, SubscriptionId};
use heapcast_core::logging::CONNECTED_OBJECTS_TARGET;
use heapcast_core::subscription::CloseReason;
use tracing::info;

use crate::transport::LogExtension;

fn extension(ext: Option<&LogExtension>) -> String {
    ext.map(ToString::to_string).unwrap_or_default()
}

pub(crate) fn subscribed(
    session: &SessionId,
    uri: &HeapUri,
    heap_id: HeapId,
    subscription: &SubscriptionId,
    ext: Option<&LogExtension>,
) {
    info!(
        target: CONNECTED_OBJECTS_TARGET,
        session_id = %session,
        uri = %uri,
        heap_id = %heap_id,
        subscription_id = %subscription,
        extra = %extension(ext),
        "subscription opened"
    );
}

pub(crate) fn rejected(session: &SessionId, uri: &HeapUri, code: &str, ext: Option<&LogExtension>) {
    info!(
        target: CONNECTED_OBJECTS_TARGET,
        session_id = %session,
        uri = %uri,
        code,
        extra = %extension(ext),
        "subscription rejected"
    );
}

pub(crate) fn closed(
    session: &SessionId,
    uri: &HeapUri,
    subscription: &SubscriptionId,
    reason: CloseReason,
    ext: Option<&LogExtension>,
) {
    info!(
        target: CONNECTED_OBJECTS_TARGET,
        session_id = %session,
        uri = %uri,
        subscription_id = %subscription,
        reason = reason.as_str(),
        extra = %extension(ext),
        "subscription closed"
    );
}
