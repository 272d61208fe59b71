//! Settings type definitions.
//!
//! Every struct is `#[serde(default)]` so partial JSON files work: missing
//! fields keep their compiled default.

use serde::{Deserialize, Serialize};

/// Root settings for the bridge.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "backend": { "kind": "upstream", "upstreamAddr": "10.0.0.5:7000" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    pub version: String,
    pub server: ServerSettings,
    pub backend: BackendSettings,
    pub telemetry: TelemetrySettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            server: ServerSettings::default(),
            backend: BackendSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

// ── server ──────────────────────────────────────────────────────────────────

/// WebSocket listener and per-session limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. 0 picks a free port.
    pub port: u16,
    /// Outbound envelopes buffered per session before pumps wait.
    pub max_send_queue: usize,
    /// Backend events buffered per call.
    pub call_buffer: usize,
    /// Largest binary message accepted from a client, in bytes.
    pub max_frame_bytes: usize,
    /// Interval between WebSocket pings.
    pub heartbeat_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            max_send_queue: 256,
            call_buffer: 32,
            max_frame_bytes: 16 * 1024 * 1024,
            heartbeat_secs: 30,
        }
    }
}

// ── backend ─────────────────────────────────────────────────────────────────

/// Which backend serves calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process echo handler.
    #[default]
    Echo,
    /// Remote server speaking the envelope protocol over TCP.
    Upstream,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Upstream => "upstream",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "echo" => Some(Self::Echo),
            "upstream" => Some(Self::Upstream),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    /// `host:port` of the upstream server.
    pub upstream_addr: String,
    /// TCP connect timeout in milliseconds.
    pub upstream_connect_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Echo,
            upstream_addr: "127.0.0.1:7000".to_string(),
            upstream_connect_ms: 5_000,
        }
    }
}

// ── telemetry ───────────────────────────────────────────────────────────────

/// Log level name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub log_level: LogLevel,
    /// Persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub metrics_enabled: bool,
    pub metrics_snapshot_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_sqlite: true,
            metrics_enabled: true,
            metrics_snapshot_secs: 60,
            metrics_retention_days: 7,
        }
    }
}
