use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use bridge_backend::Backend;

use crate::connection;
use crate::metrics::BridgeMetrics;
use crate::registry::SessionRegistry;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds a free port; see [`ServerHandle::port`].
    pub port: u16,
    pub max_send_queue: usize,
    pub call_buffer: usize,
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8090,
            max_send_queue: 256,
            call_buffer: 32,
            max_frame_bytes: bridge_core::DEFAULT_MAX_FRAME_LEN,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub backend: Arc<dyn Backend>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: BridgeMetrics,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns once the port is bound.
pub async fn start(
    config: ServerConfig,
    backend: Arc<dyn Backend>,
    metrics: BridgeMetrics,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let sessions = Arc::new(SessionRegistry::new());
    let addr = format!("{}:{}", config.host, config.port);

    let state = AppState {
        config: Arc::new(config),
        backend,
        sessions: Arc::clone(&sessions),
        metrics,
        shutdown: shutdown.clone(),
    };
    let backend_name = state.backend.name().to_string();
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, backend = %backend_name, "bridge server started");

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        sessions,
        shutdown,
        server,
    })
}

/// Handle returned by [`start`]. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    sessions: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Close every session with 1001 and stop accepting connections.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .is_err()
        {
            tracing::warn!("server did not stop within 5s");
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    // Room for the length prefix on top of the largest accepted frame.
    let max_message = state.config.max_frame_bytes.saturating_add(64);
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| connection::serve_socket(socket, state))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "backend": state.backend.name(),
        "sessions": state.sessions.summary(),
    }))
}
