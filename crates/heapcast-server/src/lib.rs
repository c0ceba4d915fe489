//! # heapcast-server
//!
//! Connected-object push engine and its WebSocket transport.
//!
//! A publisher offers live object graphs ([`Heap`](heapcast_core::heap::Heap)s)
//! through a [`HeapCatalog`]. Clients subscribe over WebSocket; the
//! [`ConnectedObjectManager`] sends each new subscriber the heap's full state
//! and then streams every later change as sequenced, size-bounded delta batches,
//! encoded once per protocol version and fanned out to all attached sessions.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`push`] | Heap registry, subscription lifecycle, change queue, pusher pool |
//! | [`transport`] | The `Session` / `OperationContext` boundary the engine writes through |
//! | [`websocket`] | Axum WebSocket sessions and HTTP endpoints |
//! | [`catalog`] | Publisher-side lookup of heaps by uri |
//! | [`metrics`] | Prometheus recorder and metric names |
//! | [`errors`] | Subscribe errors |

#![deny(unsafe_code)]

pub mod catalog;
pub mod errors;
pub mod metrics;
pub mod push;
pub mod transport;
pub mod websocket;

pub use catalog::HeapCatalog;
pub use errors::SubscribeError;
pub use push::{ConnectedObjectManager, HeapStats, PushConfig};
pub use transport::{LogExtension, OperationContext, Session, SessionRef, TransportError};
