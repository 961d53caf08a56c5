//! # convgate
//!
//! Conversion gateway binary: loads settings, starts the host thread and the
//! WebSocket listener, and runs until interrupted.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use convgate_host::{
    host_channel, ConversionEngine, HostThread, JobExecutor, ResetHostDocument, SimulatedEngine,
};
use convgate_server::{Gateway, ServerConfig};
use convgate_settings::GatewaySettings;
use convgate_telemetry::{JobLogStore, LogQuery, TelemetryConfig};

const HOST_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const JOB_LOG_LIMIT: u32 = 1000;

/// Conversion gateway server.
#[derive(Parser, Debug)]
#[command(name = "convgate", about = "WebSocket gateway for single-flight file conversions")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file. Defaults to `~/.convgate/settings.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default log level (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,

    /// Milliseconds to wait for the host thread to accept a job.
    #[arg(long)]
    dispatch_timeout_ms: Option<u64>,

    /// Milliseconds the simulated engine spends on each stage.
    #[arg(long)]
    step_delay_ms: Option<u64>,

    /// Print the persisted warnings and errors of one job as JSON lines,
    /// oldest first, and exit.
    #[arg(long, value_name = "JOB_ID")]
    logs: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut GatewaySettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.pretty {
            settings.logging.json = false;
        }
        if let Some(ms) = self.dispatch_timeout_ms {
            settings.dispatch.timeout_ms = ms;
        }
        if let Some(ms) = self.step_delay_ms {
            settings.engine.step_delay_ms = ms;
        }
    }
}

/// Write the stored records of `job_id` to `out`, oldest first.
fn write_job_logs(store: &JobLogStore, job_id: &str, out: &mut impl Write) -> Result<usize> {
    let mut records = store.query(&LogQuery {
        limit: Some(JOB_LOG_LIMIT),
        ..LogQuery::for_job(job_id)
    })?;
    records.reverse();
    for record in &records {
        writeln!(out, "{}", serde_json::to_string(record)?)?;
    }
    Ok(records.len())
}

fn print_job_logs(settings: &GatewaySettings, job_id: &str) -> Result<()> {
    let Some(path) = settings.logging.sqlite_path.as_deref().map(Path::new) else {
        bail!("No log store configured (set logging.sqlitePath or CONVGATE_LOG_DB)");
    };
    if !path.exists() {
        bail!("Log store not found: {}", path.display());
    }
    let store = JobLogStore::open(path)
        .with_context(|| format!("Failed to open log store: {}", path.display()))?;
    write_job_logs(&store, job_id, &mut std::io::stdout().lock())?;
    Ok(())
}

fn telemetry_config(settings: &GatewaySettings) -> TelemetryConfig {
    let log_level = settings
        .logging
        .level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    TelemetryConfig {
        log_level,
        json: settings.logging.json,
        log_db_path: settings.logging.sqlite_path.as_ref().map(PathBuf::from),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_file = cli.config.clone().unwrap_or_else(convgate_settings::settings_path);
    let mut settings = convgate_settings::load_settings_from_path(&settings_file)
        .with_context(|| format!("Failed to load settings: {}", settings_file.display()))?;
    cli.apply(&mut settings);
    convgate_settings::loader::validate(&settings).context("Invalid command-line override")?;

    if let Some(ref job_id) = cli.logs {
        return print_job_logs(&settings, job_id);
    }

    let _telemetry = convgate_telemetry::init_telemetry(telemetry_config(&settings));
    tracing::info!(settings = %settings_file.display(), "starting convgate");

    let engine: Arc<dyn ConversionEngine> =
        Arc::new(SimulatedEngine::new(settings.engine.step_delay()));
    let (sender, inbox) = host_channel();
    let cleanup = Arc::new(ResetHostDocument::new(Arc::clone(&engine), sender.affinity()));
    let host = HostThread::spawn(inbox, JobExecutor::new(engine))
        .context("Failed to spawn host thread")?;

    let gateway = Gateway::new(cleanup, Arc::new(sender), settings.dispatch.timeout());
    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        heartbeat_interval: settings.server.heartbeat_interval(),
    };
    let handle = convgate_server::start(config, gateway)
        .await
        .with_context(|| {
            format!(
                "Failed to bind {}:{}",
                settings.server.host, settings.server.port
            )
        })?;
    tracing::info!(port = handle.port(), "convgate ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;

    // The host thread exits once the last sender is dropped with the listener.
    let deadline = tokio::time::Instant::now() + HOST_JOIN_TIMEOUT;
    while !host.is_finished() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if host.is_finished() {
        host.join();
    } else {
        tracing::warn!("host thread still busy, exiting without it");
    }
    Ok(())
}
