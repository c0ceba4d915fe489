//! Connected-object push engine.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `state` | Per-heap state, change queue and the per-object lock |
//! | `registry` | Global index of live heaps and per-session interest |
//! | `adapter` | Heap listener that queues updates and signals the pool |
//! | `manager` | Subscription lifecycle and teardown |
//! | `pool` | Pusher workers: drain, batch, encode, fan out |
//! | `batch` | Size-bounded batching of update runs |
//! | `monitor` | Heap statistics for monitoring endpoints |
//! | `audit` | Connected-object audit log lines |
//!
//! ## Locking
//!
//! Three lock levels, always taken in this order:
//!
//! 1. the per-object lock of one heap state;
//! 2. the global registry lock;
//! 3. the change queue of one heap state (a leaf).
//!
//! A heap's own internal lock ranks between 2 and 3: the engine calls into the
//! heap (traverse, listener removal) with engine locks held, and the heap calls
//! the change adapter, which only takes the queue lock. No path holds two
//! per-object locks.

mod adapter;
mod audit;
mod batch;
mod manager;
mod monitor;
mod pool;
mod registry;
mod state;

pub use manager::{ConnectedObjectManager, PushConfig};
pub use monitor::HeapStats;
