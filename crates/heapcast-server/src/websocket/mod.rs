//! WebSocket transport and HTTP endpoints.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `connection` | Per-connection [`Session`](crate::transport::Session), read/write loops, heartbeat |
//! | `handler` | Subscribe / unsubscribe request parsing and replies |
//! | `server` | Axum router: `/ws`, `/health`, `/heaps`, `/metrics` |
//!
//! ## Data Flow
//!
//! `connection` → `handler` → [`ConnectedObjectManager`](crate::push::ConnectedObjectManager).
//! Pusher workers write frames back through `connection`'s bounded queue.

pub mod connection;
pub mod handler;
pub mod server;
