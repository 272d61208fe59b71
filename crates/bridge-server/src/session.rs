use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bridge_backend::{Backend, BackendError, Dispatcher};
use bridge_core::{DecodeError, Envelope, SessionId};
use bridge_schema::{Registry, SchemaError, SchemaKind};

use crate::metrics::BridgeMetrics;
use crate::multiplexer::{CallMultiplexer, ProtocolViolation};

/// WebSocket close code for a handshake or schema the bridge cannot use.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code when the backend cannot be reached.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingSchema,
    Active,
    Closed,
}

/// First message of every session.
#[derive(Clone, Debug, Deserialize)]
pub struct Handshake {
    pub filename: String,
    pub contents: String,
}

impl Handshake {
    pub fn parse(raw: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(raw).map_err(|e| SessionError::Handshake(e.to_string()))
    }
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid handshake: {0}")]
    Handshake(String),
    #[error("schema rejected: {0}")]
    Schema(#[from] SchemaError),
    #[error("backend unavailable: {0}")]
    Backend(#[from] BackendError),
}

impl SessionError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Handshake(_) | Self::Schema(_) => CLOSE_POLICY_VIOLATION,
            Self::Backend(_) => CLOSE_INTERNAL_ERROR,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::Schema(e) => e.error_kind(),
            Self::Backend(e) => e.error_kind(),
        }
    }
}

/// A message read from the client socket.
#[derive(Clone, Debug)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
}

/// Per-session limits.
#[derive(Clone, Copy, Debug)]
pub struct SessionLimits {
    pub call_buffer: usize,
    pub max_frame_bytes: usize,
}

/// One client connection: handshake, then envelopes for the multiplexer.
pub struct Session {
    id: SessionId,
    state: SessionState,
    backend: Arc<dyn Backend>,
    outbound: mpsc::Sender<Envelope>,
    limits: SessionLimits,
    metrics: BridgeMetrics,
    mux: Option<CallMultiplexer>,
}

impl Session {
    pub fn new(
        id: SessionId,
        backend: Arc<dyn Backend>,
        outbound: mpsc::Sender<Envelope>,
        limits: SessionLimits,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            id,
            state: SessionState::AwaitingSchema,
            backend,
            outbound,
            limits,
            metrics,
            mux: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn multiplexer(&self) -> Option<&CallMultiplexer> {
        self.mux.as_ref()
    }

    /// Process one inbound message. An error means the session is over and
    /// the socket should be closed with [`SessionError::close_code`].
    pub async fn handle(&mut self, message: Inbound) -> Result<(), SessionError> {
        match self.state {
            SessionState::AwaitingSchema => {
                let raw = match &message {
                    Inbound::Text(text) => text.as_bytes(),
                    Inbound::Binary(bytes) => bytes.as_ref(),
                };
                let result = self.activate(raw).await;
                if result.is_err() {
                    self.close();
                }
                result
            }
            SessionState::Active => {
                match message {
                    Inbound::Binary(bytes) => self.dispatch(&bytes).await,
                    Inbound::Text(_) => self.violation(ProtocolViolation::TextAfterHandshake),
                }
                Ok(())
            }
            SessionState::Closed => Ok(()),
        }
    }

    async fn activate(&mut self, raw: &[u8]) -> Result<(), SessionError> {
        let handshake = Handshake::parse(raw)?;
        let kind = SchemaKind::from_filename(&handshake.filename);
        let registry = Registry::load(&handshake.contents, kind)?;
        info!(
            filename = %handshake.filename,
            kind = kind.as_str(),
            services = registry.service_count(),
            methods = registry.method_count(),
            "schema loaded"
        );

        let connection = self.backend.connect(&self.id).await?;
        let dispatcher = Dispatcher::new(connection, self.limits.call_buffer);
        self.mux = Some(CallMultiplexer::new(
            Arc::new(registry),
            dispatcher,
            self.outbound.clone(),
            self.metrics.clone(),
        ));
        self.state = SessionState::Active;
        Ok(())
    }

    async fn dispatch(&self, bytes: &[u8]) {
        let envelope = if bytes.len() > self.limits.max_frame_bytes {
            Err(DecodeError::FrameTooLarge {
                len: bytes.len(),
                max: self.limits.max_frame_bytes,
            })
        } else {
            bridge_core::decode(bytes)
        };
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), len = bytes.len(), "dropping undecodable message");
                self.metrics.decode_error();
                return;
            }
        };
        debug!(kind = envelope.kind(), call_id = envelope.call_id().get(), "envelope received");

        let Some(mux) = &self.mux else {
            return;
        };
        if let Err(v) = mux.handle(envelope) {
            self.violation(v);
        }
    }

    fn violation(&self, violation: ProtocolViolation) {
        warn!(kind = violation.kind(), error = %violation, "protocol violation");
        self.metrics.protocol_violation(violation.kind());
    }

    /// Cancel every live call and release the backend. Idempotent.
    pub fn close(&mut self) {
        if let Some(mux) = self.mux.take() {
            let live = mux.live_calls();
            mux.shutdown();
            if live > 0 {
                info!(live, "cancelled live calls on session close");
            }
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
