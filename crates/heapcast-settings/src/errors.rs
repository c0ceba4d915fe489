//! Settings error types.

use std::path::PathBuf;

/// Errors raised while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("failed to read settings file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid JSON or does not match the schema.
    #[error("invalid settings in {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Settings result alias.
pub type Result<T> = std::result::Result<T, SettingsError>;
