mod logging;

pub use logging::{JobLogLayer, JobLogStore, LogQuery, LogRecord};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "convgate_host" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout when true, human-readable otherwise.
    pub json: bool,
    /// Persist warn+ logs to this SQLite file when set.
    pub log_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_db_path: None,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string, e.g. `info,convgate_host=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed()
    };

    // Optional SQLite store for warn+ logs
    let store_layer = config.log_db_path.as_ref().and_then(|path| {
        match JobLogStore::open(path) {
            Ok(store) => Some(JobLogLayer::new(Arc::new(store))),
            Err(e) => {
                eprintln!("convgate-telemetry: failed to open log DB {}: {e}", path.display());
                None
            }
        }
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(store_layer)
        .try_init()
    {
        eprintln!("convgate-telemetry: subscriber already installed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("convgate_host".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(config.filter_directives(), "warn,convgate_host=debug");
    }

    #[test]
    fn defaults_log_json_without_sqlite() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.json);
        assert!(config.log_db_path.is_none());
    }
}
