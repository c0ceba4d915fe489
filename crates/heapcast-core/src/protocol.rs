//! Push wire messages and the per-version codec.
//!
//! Three messages flow from server to client:
//!
//! | Message | When |
//! |---------|------|
//! | [`NewSubscription`] | Reply to a subscribe request |
//! | [`PushMessage::Delta`] | Initial state (`initial = true`) or a batch of updates |
//! | [`PushMessage::Terminate`] | A subscription ended for a notifying cause |
//!
//! Clients negotiate a [`ProtocolVersion`] when they connect. [`encode`] turns a
//! message into shared bytes for one version; the engine encodes each batch once
//! per version and hands the same bytes to every session speaking it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::CodecError;
use crate::heap::UpdateAction;
use crate::ids::{HeapId, HeapUri, SubscriptionId};
use crate::subscription::CloseReason;

/// Wire protocol version spoken by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Tagged JSON objects.
    V1,
    /// Compact positional JSON arrays.
    V2,
}

impl ProtocolVersion {
    /// Latest version this build speaks.
    pub const LATEST: Self = Self::V2;

    /// Parse a numeric version as sent by clients.
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    /// Numeric form.
    pub fn number(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

/// Reply to a successful subscribe request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    /// Id the client uses to unsubscribe.
    pub subscription_id: SubscriptionId,
    /// Numeric handle used by every later message about this heap.
    pub heap_id: HeapId,
    /// Heap identity, present only the first time this session subscribes to it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uri: Option<HeapUri>,
}

/// Server → client push message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushMessage {
    /// Subscription accepted.
    NewSubscription(NewSubscription),

    /// Initial state or a batch of updates for one heap.
    #[serde(rename_all = "camelCase")]
    Delta {
        /// Heap handle.
        heap_id: HeapId,
        /// Batch sequence number; initial state carries the last delivered one.
        sequence: u64,
        /// Whether this is a full-state snapshot.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        initial: bool,
        /// Actions, in application order.
        actions: Vec<UpdateAction>,
    },

    /// A subscription ended.
    #[serde(rename_all = "camelCase")]
    Terminate {
        /// Heap handle.
        heap_id: HeapId,
        /// The ended subscription.
        subscription_id: SubscriptionId,
        /// Why it ended.
        reason: CloseReason,
    },
}

impl PushMessage {
    /// Message type label, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewSubscription(_) => "new_subscription",
            Self::Delta { .. } => "delta",
            Self::Terminate { .. } => "terminate",
        }
    }
}

/// Client request to end one subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateRequest {
    /// Heap handle the subscription belongs to.
    pub heap_id: HeapId,
    /// The subscription to end.
    pub subscription_id: SubscriptionId,
    /// Cause, normally [`CloseReason::RequestedByClient`].
    pub reason: CloseReason,
}

/// Encode `message` for `version`.
pub fn encode(message: &PushMessage, version: ProtocolVersion) -> Result<Bytes, CodecError> {
    let raw = match version {
        ProtocolVersion::V1 => serde_json::to_vec(message)?,
        ProtocolVersion::V2 => serde_json::to_vec(&compact(message)?)?,
    };
    Ok(Bytes::from(raw))
}

/// Decode bytes produced by [`encode`].
pub fn decode(bytes: &[u8], version: ProtocolVersion) -> Result<PushMessage, CodecError> {
    match version {
        ProtocolVersion::V1 => Ok(serde_json::from_slice(bytes)?),
        ProtocolVersion::V2 => {
            let value: Value = serde_json::from_slice(bytes)?;
            Ok(serde_json::from_value(expand(value))?)
        }
    }
}

fn compact(message: &PushMessage) -> Result<Value, CodecError> {
    Ok(match message {
        PushMessage::NewSubscription(sub) => {
            json!(["s", sub.subscription_id, sub.heap_id, sub.uri])
        }
        PushMessage::Delta {
            heap_id,
            sequence,
            initial,
            actions,
        } => json!(["d", heap_id, sequence, u8::from(*initial), serde_json::to_value(actions)?]),
        PushMessage::Terminate {
            heap_id,
            subscription_id,
            reason,
        } => json!(["t", heap_id, subscription_id, reason]),
    })
}

/// Rebuild the tagged form from the compact array form. Unknown shapes pass
/// through unchanged so `from_value` reports the error.
fn expand(value: Value) -> Value {
    let items = match value {
        Value::Array(items) => items,
        other => return other,
    };
    let expanded = match items.as_slice() {
        [tag, sub, heap, uri] if tag == "s" => Some(json!({
            "type": "newSubscription",
            "subscriptionId": sub,
            "heapId": heap,
            "uri": uri,
        })),
        [tag, heap, seq, initial, actions] if tag == "d" => Some(json!({
            "type": "delta",
            "heapId": heap,
            "sequence": seq,
            "initial": initial == 1,
            "actions": actions,
        })),
        [tag, heap, sub, reason] if tag == "t" => Some(json!({
            "type": "terminate",
            "heapId": heap,
            "subscriptionId": sub,
            "reason": reason,
        })),
        _ => None,
    };
    expanded.unwrap_or(Value::Array(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::NodeKind;
    use assert_matches::assert_matches;

    fn delta() -> PushMessage {
        PushMessage::Delta {
            heap_id: HeapId(3),
            sequence: 9,
            initial: false,
            actions: vec![UpdateAction::InstallRoot {
                node: 0,
                kind: NodeKind::Object,
            }],
        }
    }

    #[test]
    fn v1_is_tagged_json() {
        let bytes = encode(&delta(), ProtocolVersion::V1).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "delta");
        assert_eq!(value["heapId"], 3);
        assert_eq!(value["sequence"], 9);
        assert!(value.get("initial").is_none());
    }

    #[test]
    fn v2_is_positional() {
        let bytes = encode(&delta(), ProtocolVersion::V2).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value[0], "d");
        assert_eq!(value[1], 3);
        assert_eq!(value[2], 9);
        assert_eq!(value[3], 0);
    }

    #[test]
    fn versions_produce_different_bytes_for_same_message() {
        let v1 = encode(&delta(), ProtocolVersion::V1).unwrap();
        let v2 = encode(&delta(), ProtocolVersion::V2).unwrap();
        assert_ne!(v1, v2);
        assert_eq!(decode(&v1, ProtocolVersion::V1).unwrap(), delta());
        assert_eq!(decode(&v2, ProtocolVersion::V2).unwrap(), delta());
    }

    #[test]
    fn new_subscription_omits_absent_uri() {
        let msg = PushMessage::NewSubscription(NewSubscription {
            subscription_id: "sub_1".into(),
            heap_id: HeapId(1),
            uri: None,
        });
        let value: Value = serde_json::from_slice(&encode(&msg, ProtocolVersion::V1).unwrap()).unwrap();
        assert_eq!(value["type"], "newSubscription");
        assert!(value.get("uri").is_none());
    }

    #[test]
    fn terminate_carries_reason() {
        let msg = PushMessage::Terminate {
            heap_id: HeapId(1),
            subscription_id: "sub_1".into(),
            reason: CloseReason::RequestedByPublisher,
        };
        let bytes = encode(&msg, ProtocolVersion::V2).unwrap();
        assert_matches!(
            decode(&bytes, ProtocolVersion::V2).unwrap(),
            PushMessage::Terminate { reason: CloseReason::RequestedByPublisher, .. }
        );
    }

    #[test]
    fn version_numbers() {
        assert_eq!(ProtocolVersion::from_number(1), Some(ProtocolVersion::V1));
        assert_eq!(ProtocolVersion::from_number(3), None);
        assert_eq!(ProtocolVersion::LATEST.number(), 2);
    }
}
