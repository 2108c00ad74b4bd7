//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If `~/.relay/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::RelaySettings;

/// Resolve the path to the settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or the merged result fails validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    // ── Broker settings ─────────────────────────────────────────────
    if let Some(v) = read_env_string("RELAY_NAMESPACE") {
        settings.broker.namespace = v;
    }
    if let Some(v) = read_env_string("RELAY_ENTITY_PATH") {
        settings.broker.entity_path = v;
    }
    if let Some(v) = read_env_u64("RELAY_MAX_DELIVERY_COUNT", 1, 2000) {
        settings.broker.max_delivery_count = v as u32;
    }
    if let Some(v) = read_env_u64("RELAY_LEASE_DURATION_MS", 10, 3_600_000) {
        settings.broker.lease_duration_ms = v;
    }

    // ── Processor settings ──────────────────────────────────────────
    if let Some(v) = read_env_bool("RELAY_AUTO_COMPLETE") {
        settings.processor.auto_complete_messages = v;
    }
    if let Some(v) = read_env_usize("RELAY_MAX_SESSIONS", 1, 10_000) {
        settings.processor.max_concurrent_sessions = v;
    }
    if let Some(v) = read_env_usize("RELAY_MAX_CALLS_PER_SESSION", 1, 1_000) {
        settings.processor.max_concurrent_calls_per_session = v;
    }
    if let Some(v) = read_env_string("RELAY_SESSION_IDS") {
        settings.processor.session_ids = parse_list(&v);
    }
    if let Some(v) = read_env_u64("RELAY_SESSION_IDLE_TIMEOUT_MS", 0, 3_600_000) {
        settings.processor.session_idle_timeout_ms = v;
    }

    // ── Routing settings ────────────────────────────────────────────
    if let Some(v) = read_env_string("RELAY_DEFAULT_SESSION") {
        settings.routing.default_session = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a comma-separated list, trimming entries and dropping empties.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "processor": {"maxConcurrentSessions": 8, "autoCompleteMessages": true}
        });
        let source = serde_json::json!({
            "processor": {"maxConcurrentSessions": 5}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["processor"]["maxConcurrentSessions"], 5);
        assert_eq!(merged["processor"]["autoCompleteMessages"], true);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"sessionIds": ["a", "b", "c"]});
        let source = serde_json::json!({"sessionIds": ["session-1"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["sessionIds"], serde_json::json!(["session-1"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let path = Path::new("/nonexistent/settings.json");
        let settings = load_settings_from_path(path).unwrap();
        assert_eq!(settings.broker.max_delivery_count, 10);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "processor": {
                    "autoCompleteMessages": false,
                    "maxConcurrentSessions": 5,
                    "maxConcurrentCallsPerSession": 2,
                    "sessionIds": ["session-1", "session-2"]
                },
                "routing": {
                    "rules": [{"contains": "CUSTOMER A", "session": "session-1"}],
                    "defaultSession": "session-4"
                }
            }"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert!(!settings.processor.auto_complete_messages);
        assert_eq!(settings.processor.max_concurrent_sessions, 5);
        assert_eq!(settings.processor.max_concurrent_calls_per_session, 2);
        assert_eq!(settings.processor.session_ids, vec!["session-1", "session-2"]);
        assert_eq!(settings.routing.rules.len(), 1);
        assert_eq!(settings.routing.default_session, "session-4");
        // untouched sections keep defaults
        assert_eq!(settings.broker.lease_duration_ms, 30_000);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"processor": {"maxConcurrentSessions": 0}}"#).unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::InvalidValue(_)));
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("30000", 10, 3_600_000), Some(30_000));
        assert_eq!(parse_u64_range("5", 10, 100), None);
        assert_eq!(parse_usize_range("abc", 1, 10), None);
        assert_eq!(parse_usize_range("10", 1, 10), Some(10));
    }

    #[test]
    fn parse_list_trims_and_skips_empty() {
        assert_eq!(
            parse_list(" session-1, session-2,,"),
            vec!["session-1".to_string(), "session-2".to_string()]
        );
        assert!(parse_list("").is_empty());
    }
}
