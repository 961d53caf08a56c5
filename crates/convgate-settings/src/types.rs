//! Settings types. JSON keys are camelCase; every section falls back to its
//! defaults field by field.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings object, mirroring `~/.convgate/settings.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    pub server: ServerSettings,
    pub dispatch: DispatchSettings,
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// WebSocket port. `0` picks a free port.
    pub port: u16,
    /// Interval between heartbeat pings to each client.
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// How long the host may take to claim a dispatched job.
    pub timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl DispatchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for the built-in simulated engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Pause after each reported stage.
    pub step_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { step_delay_ms: 250 }
    }
}

impl EngineSettings {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter level; `RUST_LOG` takes precedence.
    pub level: String,
    /// JSON lines when true, human-readable otherwise.
    pub json: bool,
    /// SQLite file for persisted WARN+ records. Disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            sqlite_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = GatewaySettings::default();
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.server.port, 8081);
        assert_eq!(s.server.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(s.dispatch.timeout(), Duration::from_secs(10));
        assert_eq!(s.engine.step_delay(), Duration::from_millis(250));
        assert_eq!(s.logging.level, "info");
        assert!(s.logging.json);
        assert!(s.logging.sqlite_path.is_none());
    }

    #[test]
    fn keys_are_camel_case() {
        let v = serde_json::to_value(GatewaySettings::default()).unwrap();
        assert_eq!(v["server"]["heartbeatIntervalMs"], 30_000);
        assert_eq!(v["dispatch"]["timeoutMs"], 10_000);
        assert_eq!(v["engine"]["stepDelayMs"], 250);
        assert!(v["logging"].get("sqlitePath").is_none());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let s: GatewaySettings =
            serde_json::from_str(r#"{"server":{"port":9000}}"#).unwrap();
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.dispatch, DispatchSettings::default());
    }
}
