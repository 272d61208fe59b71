//! # rpc-bridge
//!
//! Bridge server binary: loads settings, installs telemetry, picks a
//! backend and serves WebSocket sessions until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use bridge_backend::{Backend, LocalBackend, UpstreamBackend, UpstreamConfig};
use bridge_server::{BridgeMetrics, ServerConfig};
use bridge_settings::{BackendKind, BridgeSettings};
use bridge_telemetry::{data_dir, init_telemetry, parse_level, TelemetryConfig};

/// Dynamic-schema RPC bridge.
#[derive(Parser, Debug)]
#[command(name = "rpc-bridge", about = "WebSocket to RPC bridge")]
struct Cli {
    /// Settings file (defaults to ~/.rpc-bridge/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Backend serving calls.
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// Upstream server address (`host:port`), implies `--backend upstream`.
    #[arg(long)]
    upstream: Option<String>,
}

impl Cli {
    /// Flags win over environment and file.
    fn apply(&self, settings: &mut BridgeSettings) {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(kind) = self.backend {
            settings.backend.kind = kind;
        }
        if let Some(addr) = &self.upstream {
            settings.backend.upstream_addr = addr.clone();
            if self.backend.is_none() {
                settings.backend.kind = BackendKind::Upstream;
            }
        }
    }
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    BackendKind::parse(s).ok_or_else(|| format!("unknown backend `{s}` (expected echo or upstream)"))
}

fn telemetry_config(settings: &BridgeSettings) -> Result<TelemetryConfig> {
    let t = &settings.telemetry;
    let db_dir = data_dir().join("database");
    Ok(TelemetryConfig {
        log_level: parse_level(t.log_level.as_filter_str())?,
        log_to_sqlite: t.log_to_sqlite,
        log_db_path: db_dir.join("bridge-logs.db"),
        metrics_enabled: t.metrics_enabled,
        metrics_db_path: db_dir.join("bridge-metrics.db"),
        metrics_snapshot_interval_secs: t.metrics_snapshot_secs,
        metrics_retention_days: t.metrics_retention_days,
        ..Default::default()
    })
}

fn server_config(settings: &BridgeSettings) -> ServerConfig {
    let s = &settings.server;
    ServerConfig {
        host: s.host.clone(),
        port: s.port,
        max_send_queue: s.max_send_queue,
        call_buffer: s.call_buffer,
        max_frame_bytes: s.max_frame_bytes,
        heartbeat_interval: Duration::from_secs(s.heartbeat_secs),
    }
}

fn backend(settings: &BridgeSettings) -> Arc<dyn Backend> {
    match settings.backend.kind {
        BackendKind::Echo => Arc::new(LocalBackend::echo()),
        BackendKind::Upstream => Arc::new(UpstreamBackend::new(UpstreamConfig {
            addr: settings.backend.upstream_addr.clone(),
            connect_timeout: Duration::from_millis(settings.backend.upstream_connect_ms),
            max_frame_len: settings.server.max_frame_bytes,
        })),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(bridge_settings::settings_path);
    let mut settings = bridge_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);
    bridge_settings::validate(&settings).context("invalid settings after command-line flags")?;

    let telemetry = init_telemetry(telemetry_config(&settings)?);
    let _snapshots = telemetry.spawn_metrics_snapshots();
    tracing::info!(
        settings = %settings_path.display(),
        backend = settings.backend.kind.as_str(),
        "starting rpc-bridge"
    );

    let handle = bridge_server::start(
        server_config(&settings),
        backend(&settings),
        BridgeMetrics::new(telemetry.metrics()),
    )
    .await
    .with_context(|| {
        format!(
            "failed to bind {}:{}",
            settings.server.host, settings.server.port
        )
    })?;
    tracing::info!(port = handle.port, "rpc-bridge ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;

    if let Some(metrics) = telemetry.metrics() {
        if let Err(e) = metrics.snapshot() {
            tracing::warn!(error = %e, "final metrics snapshot failed");
        }
    }
    Ok(())
}
