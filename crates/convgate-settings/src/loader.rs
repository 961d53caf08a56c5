//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `CONVGATE_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::GatewaySettings;

pub const ENV_HOST: &str = "CONVGATE_HOST";
pub const ENV_PORT: &str = "CONVGATE_PORT";
pub const ENV_HEARTBEAT_INTERVAL: &str = "CONVGATE_HEARTBEAT_INTERVAL";
pub const ENV_DISPATCH_TIMEOUT: &str = "CONVGATE_DISPATCH_TIMEOUT";
pub const ENV_STEP_DELAY: &str = "CONVGATE_STEP_DELAY";
pub const ENV_LOG_LEVEL: &str = "CONVGATE_LOG_LEVEL";
pub const ENV_LOG_JSON: &str = "CONVGATE_LOG_JSON";
pub const ENV_LOG_DB: &str = "CONVGATE_LOG_DB";

/// Resolve the path to the settings file (`~/.convgate/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".convgate").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// File layer only: defaults deep-merged with the file, if present.
pub fn read_settings_file(path: &Path) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

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

/// Apply `CONVGATE_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut GatewaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Values are parsed strictly; anything unparseable or out of range is
/// logged and ignored.
pub fn apply_overrides(settings: &mut GatewaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string(ENV_HOST) {
        settings.server.host = v;
    }
    if let Some(v) = env.u16(ENV_PORT, 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.u64(ENV_HEARTBEAT_INTERVAL, 1000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64(ENV_DISPATCH_TIMEOUT, 100, 600_000) {
        settings.dispatch.timeout_ms = v;
    }
    if let Some(v) = env.u64(ENV_STEP_DELAY, 0, 60_000) {
        settings.engine.step_delay_ms = v;
    }
    if let Some(v) = env.string(ENV_LOG_LEVEL).as_deref().and_then(parse_level) {
        settings.logging.level = v.to_string();
    }
    if let Some(v) = env.bool(ENV_LOG_JSON) {
        settings.logging.json = v;
    }
    if let Some(v) = env.string(ENV_LOG_DB) {
        settings.logging.sqlite_path = Some(v);
    }
}

/// Reject values that deserialize fine but cannot run.
pub fn validate(settings: &GatewaySettings) -> Result<()> {
    if settings.dispatch.timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "dispatch.timeoutMs must be greater than 0".into(),
        ));
    }
    if settings.server.heartbeat_interval_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "server.heartbeatIntervalMs must be greater than 0".into(),
        ));
    }
    if settings.server.host.trim().is_empty() {
        return Err(SettingsError::InvalidValue("server.host is empty".into()));
    }
    if parse_level(&settings.logging.level).is_none() {
        return Err(SettingsError::InvalidValue(format!(
            "logging.level must be one of {}, got '{}'",
            LOG_LEVELS.join("/"),
            settings.logging.level
        )));
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Normalised log level name, case-insensitive.
pub fn parse_level(val: &str) -> Option<&'static str> {
    let val = val.trim().to_ascii_lowercase();
    LOG_LEVELS.iter().copied().find(|level| *level == val)
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}
