//! Branded identifier newtypes.
//!
//! Identities that cross the wire are newtypes rather than bare `String`/`u64`
//! so a subscription id can never be passed where a session id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// URI-like identity of a published object graph. Stable for the graph's lifetime.
    HeapUri
);

string_id!(
    /// Identity of a transport-level client session.
    SessionId
);

string_id!(
    /// Identity of one session's interest in one published object.
    SubscriptionId
);

impl SessionId {
    /// Allocate a fresh, time-ordered session id.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionId {
    /// Allocate a fresh, time-ordered subscription id.
    pub fn new() -> Self {
        Self(format!("sub_{}", uuid::Uuid::now_v7().simple()))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-local numeric handle for a published object.
///
/// Sent to clients in place of the [`HeapUri`] after the first disclosure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeapId(pub u64);

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_ids_are_unique() {
        let a = SubscriptionId::new();
        let b = SubscriptionId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("sub_"));
    }

    #[test]
    fn heap_uri_serializes_transparently() {
        let uri = HeapUri::from("heapcast://prices/eur");
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"heapcast://prices/eur\"");
        let back: HeapUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
    }

    #[test]
    fn heap_id_displays_as_number() {
        assert_eq!(HeapId(42).to_string(), "42");
        assert_eq!(serde_json::to_string(&HeapId(7)).unwrap(), "7");
    }
}
