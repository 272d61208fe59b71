//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{BackendKind, BridgeSettings, LogLevel};

/// `~/.rpc-bridge/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".rpc-bridge").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BridgeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an unusable value is an
/// error.
pub fn load_settings_from_path(path: &Path) -> Result<BridgeSettings> {
    let mut settings = load_file(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<BridgeSettings> {
    let defaults = serde_json::to_value(BridgeSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `BRIDGE_*` overrides read through `lookup`.
///
/// Empty values are ignored. Values that fail to parse or fall outside
/// their range are logged and ignored, leaving the file/default value.
pub fn apply_overrides(settings: &mut BridgeSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = Env(lookup);

    // ── server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("BRIDGE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("BRIDGE_PORT", |s| parse_range::<u16>(s, 0, u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("BRIDGE_MAX_SEND_QUEUE", |s| parse_range::<usize>(s, 1, 1_000_000)) {
        settings.server.max_send_queue = v;
    }
    if let Some(v) = env.parsed("BRIDGE_CALL_BUFFER", |s| parse_range::<usize>(s, 1, 100_000)) {
        settings.server.call_buffer = v;
    }
    if let Some(v) = env.parsed("BRIDGE_MAX_FRAME_BYTES", |s| {
        parse_range::<usize>(s, 64, 1024 * 1024 * 1024)
    }) {
        settings.server.max_frame_bytes = v;
    }
    if let Some(v) = env.parsed("BRIDGE_HEARTBEAT_SECS", |s| parse_range::<u64>(s, 1, 3_600)) {
        settings.server.heartbeat_secs = v;
    }

    // ── backend ─────────────────────────────────────────────────────
    if let Some(v) = env.parsed("BRIDGE_BACKEND", BackendKind::parse) {
        settings.backend.kind = v;
    }
    if let Some(v) = env.string("BRIDGE_UPSTREAM_ADDR") {
        settings.backend.upstream_addr = v;
    }
    if let Some(v) = env.parsed("BRIDGE_UPSTREAM_CONNECT_MS", |s| parse_range::<u64>(s, 1, 600_000)) {
        settings.backend.upstream_connect_ms = v;
    }

    // ── telemetry ───────────────────────────────────────────────────
    if let Some(v) = env.parsed("BRIDGE_LOG_LEVEL", parse_log_level) {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = env.parsed("BRIDGE_LOG_TO_SQLITE", parse_bool) {
        settings.telemetry.log_to_sqlite = v;
    }
    if let Some(v) = env.parsed("BRIDGE_METRICS_ENABLED", parse_bool) {
        settings.telemetry.metrics_enabled = v;
    }
}

/// Reject values that parse but cannot run.
pub fn validate(settings: &BridgeSettings) -> Result<()> {
    let s = &settings.server;
    if s.max_send_queue == 0 {
        return Err(invalid("server.maxSendQueue must be at least 1"));
    }
    if s.call_buffer == 0 {
        return Err(invalid("server.callBuffer must be at least 1"));
    }
    if s.max_frame_bytes < 64 {
        return Err(invalid("server.maxFrameBytes must be at least 64"));
    }
    if s.heartbeat_secs == 0 {
        return Err(invalid("server.heartbeatSecs must be at least 1"));
    }
    if settings.backend.kind == BackendKind::Upstream && settings.backend.upstream_addr.is_empty()
    {
        return Err(invalid("backend.upstreamAddr is required for the upstream backend"));
    }
    Ok(())
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse an integer within an inclusive range.
pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_log_level(val: &str) -> Option<LogLevel> {
    serde_json::from_value(Value::String(val.trim().to_lowercase())).ok()
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8090, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(
            serde_json::json!({"a": 1, "b": 2}),
            serde_json::json!({"a": null}),
        );
        assert_eq!(merged, serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_replaces_arrays_and_primitives() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3], "a": {"nested": true}}),
            serde_json::json!({"items": [4], "a": 42}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
        assert_eq!(merged["a"], 42);
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_file(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings, BridgeSettings::default());
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9999}, "telemetry": {"logLevel": "debug"}}"#,
        )
        .unwrap();

        let settings = load_file(&path).unwrap();
        assert_eq!(settings.server.port, 9999);
        assert_eq!(settings.server.call_buffer, 32);
        assert_eq!(settings.telemetry.log_level, LogLevel::Debug);
        assert!(settings.telemetry.metrics_enabled);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn wrongly_typed_field_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"backend": {"kind": "carrier-pigeon"}}"#).unwrap();
        assert!(matches!(load_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn unusable_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"callBuffer": 0}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn env_overrides_beat_file() {
        let mut settings = BridgeSettings::default();
        settings.server.port = 9999;
        apply_overrides(
            &mut settings,
            env(&[
                ("BRIDGE_PORT", "7001"),
                ("BRIDGE_HOST", "0.0.0.0"),
                ("BRIDGE_BACKEND", "upstream"),
                ("BRIDGE_UPSTREAM_ADDR", "10.1.1.1:7000"),
                ("BRIDGE_LOG_LEVEL", "WARN"),
                ("BRIDGE_METRICS_ENABLED", "off"),
                ("BRIDGE_CALL_BUFFER", "4"),
            ]),
        );
        assert_eq!(settings.server.port, 7001);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.call_buffer, 4);
        assert_eq!(settings.backend.kind, BackendKind::Upstream);
        assert_eq!(settings.backend.upstream_addr, "10.1.1.1:7000");
        assert_eq!(settings.telemetry.log_level, LogLevel::Warn);
        assert!(!settings.telemetry.metrics_enabled);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = BridgeSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("BRIDGE_PORT", "99999"),
                ("BRIDGE_CALL_BUFFER", "0"),
                ("BRIDGE_BACKEND", "grpc"),
                ("BRIDGE_LOG_TO_SQLITE", "maybe"),
                ("BRIDGE_HOST", ""),
            ]),
        );
        assert_eq!(settings, BridgeSettings::default());
    }

    #[test]
    fn upstream_needs_an_address() {
        let mut settings = BridgeSettings::default();
        settings.backend.kind = BackendKind::Upstream;
        settings.backend.upstream_addr.clear();
        assert!(validate(&settings).is_err());
        assert!(validate(&BridgeSettings::default()).is_ok());
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_range_bounds() {
        assert_eq!(parse_range::<u64>("30", 1, 3_600), Some(30));
        assert_eq!(parse_range::<u64>("0", 1, 3_600), None);
        assert_eq!(parse_range::<u16>("65536", 0, u16::MAX), None);
        assert_eq!(parse_range::<usize>("abc", 1, 10), None);
    }

    #[test]
    fn parse_log_level_names() {
        assert_eq!(parse_log_level("Trace"), Some(LogLevel::Trace));
        assert_eq!(parse_log_level("fatal"), None);
    }
}
