//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PushSettings::default()`]
//! 2. If `~/.pushgate/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `PUSHGATE_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{LogFormat, PushSettings};

/// Resolve the path to the settings file (`~/.pushgate/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pushgate").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PushSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. A file that is not a JSON object is
/// rejected.
pub fn load_settings_from_path(path: &Path) -> Result<PushSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Load defaults merged with the file at `path`, without env overrides.
fn read_settings_file(path: &Path) -> Result<PushSettings> {
    let defaults = serde_json::to_value(PushSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        if !user.is_object() {
            return Err(SettingsError::InvalidValue(format!(
                "{} must contain a JSON object",
                path.display()
            )));
        }
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_env_overrides(settings: &mut PushSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Override application with an injectable lookup, so tests never touch the
/// process environment.
fn apply_overrides(settings: &mut PushSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };
    let server = &mut settings.server;

    if let Some(v) = env.string("PUSHGATE_HOST") {
        server.host = v;
    }
    if let Some(v) = env.u16_in("PUSHGATE_PORT", 0, 65535) {
        server.port = v;
    }
    if let Some(v) = env.string("PUSHGATE_WS_PATH") {
        server.ws_path = v;
    }
    if let Some(v) = env.string("PUSHGATE_SEND_PATH") {
        server.send_path = v;
    }
    if let Some(v) = env.usize_in("PUSHGATE_MAX_CONNECTIONS", 1, 1_000_000) {
        server.max_connections = v;
    }
    if let Some(v) = env.u64_in("PUSHGATE_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64_in("PUSHGATE_HEARTBEAT_TIMEOUT_MS", 100, 3_600_000) {
        server.heartbeat_timeout_ms = v;
    }
    if let Some(v) = env.u64_in("PUSHGATE_WRITE_TIMEOUT_MS", 10, 600_000) {
        server.write_timeout_ms = v;
    }

    if let Some(v) = env.string("PUSHGATE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("PUSHGATE_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "PUSHGATE_LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a log format name (`compact` or `json`, case-insensitive).
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_ascii_lowercase().as_str() {
        "compact" | "text" => Some(LogFormat::Compact),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
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

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn checked<T>(&self, name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }

    fn u16_in(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.checked(name, |v| parse_u16_range(v, min, max))
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.checked(name, |v| parse_u64_range(v, min, max))
    }

    fn usize_in(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.checked(name, |v| parse_usize_range(v, min, max))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"origins": ["a", "b"]});
        let source = serde_json::json!({"origins": ["c"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["origins"], serde_json::json!(["c"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = read_settings_file(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.ws_path, "/ws");
        assert_eq!(settings.server.port, 9870);
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"wsPath": "/push", "allowedOrigins": ["https://a.test"]}, "logging": {"format": "json"}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.server.ws_path, "/push");
        assert_eq!(settings.server.send_path, "/send");
        assert_eq!(settings.server.allowed_origins, vec!["https://a.test"]);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let err = read_settings_file(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn non_object_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let err = read_settings_file(&path).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    #[test]
    fn wrong_type_for_field_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": "eighty"}}"#).unwrap();

        let err = read_settings_file(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_paths_and_timeouts() {
        let mut settings = PushSettings::default();
        apply_overrides(
            &mut settings,
            env_of(&[
                ("PUSHGATE_WS_PATH", "/events"),
                ("PUSHGATE_SEND_PATH", "/publish"),
                ("PUSHGATE_PORT", "8088"),
                ("PUSHGATE_WRITE_TIMEOUT_MS", "2500"),
                ("PUSHGATE_LOG_FORMAT", "JSON"),
            ]),
        );
        assert_eq!(settings.server.ws_path, "/events");
        assert_eq!(settings.server.send_path, "/publish");
        assert_eq!(settings.server.port, 8088);
        assert_eq!(settings.server.write_timeout_ms, 2500);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = PushSettings::default();
        apply_overrides(
            &mut settings,
            env_of(&[
                ("PUSHGATE_PORT", "99999"),
                ("PUSHGATE_MAX_CONNECTIONS", "0"),
                ("PUSHGATE_LOG_FORMAT", "xml"),
                ("PUSHGATE_HOST", ""),
            ]),
        );
        let defaults = PushSettings::default();
        assert_eq!(settings.server.port, defaults.server.port);
        assert_eq!(settings.server.max_connections, defaults.server.max_connections);
        assert_eq!(settings.server.host, defaults.server.host);
        assert_eq!(settings.logging.format, LogFormat::Compact);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_log_format_variants() {
        assert_eq!(parse_log_format("compact"), Some(LogFormat::Compact));
        assert_eq!(parse_log_format("Text"), Some(LogFormat::Compact));
        assert_eq!(parse_log_format("json"), Some(LogFormat::Json));
        assert_eq!(parse_log_format("yaml"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("0", 0, 65535), Some(0));
        assert_eq!(parse_u16_range("70000", 0, 65535), None);
        assert_eq!(parse_u64_range("50", 100, 1000), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
        assert_eq!(parse_usize_range("64", 1, 100), Some(64));
    }
}
