//! # heapcast-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`HeapcastSettings::default()`]
//! 2. **Settings file**: `~/.heapcast/settings.json` or `$HEAPCAST_SETTINGS`
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `HEAPCAST_*` overrides (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use heapcast_settings::get_settings;
//!
//! let settings = get_settings();
//! println!("push workers: {}", settings.push.worker_count);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::Arc;

use parking_lot::RwLock;

/// Global settings singleton.
static SETTINGS: RwLock<Option<Arc<HeapcastSettings>>> = RwLock::new(None);

/// Get the global settings instance.
///
/// On first call, loads settings from the default path with env var
/// overrides. On subsequent calls, returns the cached value. If loading
/// fails, returns compiled defaults.
pub fn get_settings() -> Arc<HeapcastSettings> {
    if let Some(ref s) = *SETTINGS.read() {
        return Arc::clone(s);
    }

    let mut guard = SETTINGS.write();
    // Another thread may have initialized while we waited for the write lock.
    if let Some(ref s) = *guard {
        return Arc::clone(s);
    }

    let settings = Arc::new(match load_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            HeapcastSettings::default()
        }
    });
    *guard = Some(Arc::clone(&settings));
    settings
}

/// Initialize the global settings with a specific value.
///
/// Replaces any previously cached settings. Used at startup once the
/// command line has been applied.
pub fn init_settings(settings: HeapcastSettings) -> Arc<HeapcastSettings> {
    let settings = Arc::new(settings);
    *SETTINGS.write() = Some(Arc::clone(&settings));
    settings
}
