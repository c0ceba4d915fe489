//! `tracing` subscriber bootstrap.
//!
//! `RUST_LOG` always wins over the configured level so operators can raise
//! verbosity for one module without editing settings.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Tracing target for the connected-object audit log (subscribe / close events).
pub const CONNECTED_OBJECTS_TARGET: &str = "heapcast::connected_objects";

/// Install the global subscriber. Returns `false` if one was already installed.
pub fn init_subscriber(level: &str, json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.is_ok()
}
