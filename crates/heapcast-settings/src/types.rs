//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement [`Default`]
//! with production values. Every section is `#[serde(default)]`, so a settings
//! file only needs the fields it changes.

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9190 },
///   "push": { "workerCount": 8, "maxActionsPerBatch": 500 }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeapcastSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// Network and connection settings.
    pub server: ServerSettings,
    /// Push engine settings.
    pub push: PushSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for HeapcastSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "heapcast".to_string(),
            server: ServerSettings::default(),
            push: PushSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl HeapcastSettings {
    /// Correct out-of-range values.
    ///
    /// Called automatically during loading. Invalid values are replaced with
    /// the nearest valid one and a warning is logged.
    pub fn validate(&mut self) {
        let push = &mut self.push;
        if push.worker_count == 0 {
            tracing::warn!("push.workerCount must be at least 1, correcting");
            push.worker_count = 1;
        }
        if push.max_actions_per_batch == 0 {
            tracing::warn!("push.maxActionsPerBatch must be at least 1, correcting");
            push.max_actions_per_batch = 1;
        }
        if push.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            tracing::warn!(
                "push.pollIntervalMs ({}) below {MIN_POLL_INTERVAL_MS}, correcting",
                push.poll_interval_ms
            );
            push.poll_interval_ms = MIN_POLL_INTERVAL_MS;
        }
        if self.server.send_queue_capacity == 0 {
            tracing::warn!("server.sendQueueCapacity must be at least 1, correcting");
            self.server.send_queue_capacity = 1;
        }
        if !matches!(self.server.default_protocol_version, 1 | 2) {
            tracing::warn!(
                "server.defaultProtocolVersion ({}) unsupported, using 2",
                self.server.default_protocol_version
            );
            self.server.default_protocol_version = 2;
        }
    }
}

/// Smallest accepted worker dequeue timeout.
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Server network settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP/WebSocket port.
    pub port: u16,
    /// Outbound frames buffered per connection before writes start failing.
    pub send_queue_capacity: usize,
    /// Protocol version assumed when a client does not ask for one.
    pub default_protocol_version: u8,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9190,
            send_queue_capacity: 1024,
            default_protocol_version: 2,
        }
    }
}

/// Push engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushSettings {
    /// Number of pusher pool workers.
    pub worker_count: usize,
    /// Upper bound on actions per outbound batch. A single larger update is
    /// still sent whole.
    pub max_actions_per_batch: usize,
    /// How long an idle worker waits for work before re-checking for shutdown.
    pub poll_interval_ms: u64,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_actions_per_batch: 1000,
            poll_interval_ms: 250,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter (`RUST_LOG` overrides it).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = HeapcastSettings::default();
        assert_eq!(s.server.port, 9190);
        assert_eq!(s.push.worker_count, 4);
        assert_eq!(s.push.max_actions_per_batch, 1000);
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: HeapcastSettings =
            serde_json::from_str(r#"{"push": {"maxActionsPerBatch": 10}}"#).unwrap();
        assert_eq!(s.push.max_actions_per_batch, 10);
        assert_eq!(s.push.worker_count, 4);
        assert_eq!(s.server.host, "127.0.0.1");
    }

    #[test]
    fn validate_corrects_zeroes() {
        let mut s = HeapcastSettings::default();
        s.push.worker_count = 0;
        s.push.max_actions_per_batch = 0;
        s.push.poll_interval_ms = 1;
        s.server.default_protocol_version = 7;
        s.validate();
        assert_eq!(s.push.worker_count, 1);
        assert_eq!(s.push.max_actions_per_batch, 1);
        assert_eq!(s.push.poll_interval_ms, MIN_POLL_INTERVAL_MS);
        assert_eq!(s.server.default_protocol_version, 2);
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(HeapcastSettings::default()).unwrap();
        assert!(value["push"].get("maxActionsPerBatch").is_some());
        assert!(value["server"].get("sendQueueCapacity").is_some());
    }
}
