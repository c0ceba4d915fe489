//! Layered settings loading: defaults → JSON file → environment.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{Result, SettingsError};
use crate::types::HeapcastSettings;

/// Environment variable naming an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "HEAPCAST_SETTINGS";

/// Resolve the settings file path.
///
/// `HEAPCAST_SETTINGS` if set, otherwise `~/.heapcast/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Ok(explicit) = std::env::var(SETTINGS_PATH_ENV) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".heapcast").join("settings.json")
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; every
/// other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        let _ = base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Load settings from the default path with environment overrides.
///
/// A missing file is not an error; compiled defaults are used.
pub fn load_settings() -> Result<HeapcastSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with environment overrides.
pub fn load_settings_from_path(path: &Path) -> Result<HeapcastSettings> {
    let mut merged = serde_json::to_value(HeapcastSettings::default()).map_err(|source| {
        SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;

    match std::fs::read_to_string(path) {
        Ok(content) => {
            let overlay: Value =
                serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            deep_merge(&mut merged, overlay);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(?path, "no settings file, using defaults");
        }
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    let mut settings: HeapcastSettings =
        serde_json::from_value(merged).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    apply_env_overrides(&mut settings, |var| std::env::var(var).ok())?;
    settings.validate();
    Ok(settings)
}

/// Apply `HEAPCAST_*` overrides, reading variables through `lookup`.
pub fn apply_env_overrides(
    settings: &mut HeapcastSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(host) = lookup("HEAPCAST_HOST") {
        settings.server.host = host;
    }
    if let Some(port) = lookup("HEAPCAST_PORT") {
        settings.server.port = parse_env("HEAPCAST_PORT", port)?;
    }
    if let Some(workers) = lookup("HEAPCAST_PUSH_WORKERS") {
        settings.push.worker_count = parse_env("HEAPCAST_PUSH_WORKERS", workers)?;
    }
    if let Some(max) = lookup("HEAPCAST_MAX_ACTIONS") {
        settings.push.max_actions_per_batch = parse_env("HEAPCAST_MAX_ACTIONS", max)?;
    }
    if let Some(level) = lookup("HEAPCAST_LOG_LEVEL") {
        settings.logging.level = level;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidEnv { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn deep_merge_nested_objects() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        deep_merge(&mut base, json!({"a": {"b": 10}, "e": 4}));
        assert_eq!(base, json!({"a": {"b": 10, "c": 2}, "d": 3, "e": 4}));
    }

    #[test]
    fn deep_merge_replaces_non_objects() {
        let mut base = json!({"list": [1, 2]});
        deep_merge(&mut base, json!({"list": [3]}));
        assert_eq!(base, json!({"list": [3]}));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.push.worker_count, 4);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7000}, "push": {"workerCount": 2}}"#)
            .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.push.worker_count, 2);
        assert_eq!(settings.push.max_actions_per_batch, 1000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
    }

    #[test]
    fn invalid_values_are_corrected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"push": {"maxActionsPerBatch": 0}}"#).unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.push.max_actions_per_batch, 1);
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("HEAPCAST_PORT", "8088"),
            ("HEAPCAST_PUSH_WORKERS", "16"),
            ("HEAPCAST_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut settings = HeapcastSettings::default();
        apply_env_overrides(&mut settings, |k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(settings.server.port, 8088);
        assert_eq!(settings.push.worker_count, 16);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn unparsable_env_value_is_rejected() {
        let mut settings = HeapcastSettings::default();
        let err = apply_env_overrides(&mut settings, |k| {
            (k == "HEAPCAST_MAX_ACTIONS").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::InvalidEnv {
                var: "HEAPCAST_MAX_ACTIONS",
                ..
            }
        ));
    }
}
