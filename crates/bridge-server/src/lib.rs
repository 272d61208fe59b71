//! WebSocket front end of the RPC bridge: one session per connection, a
//! call multiplexer per session, one writer per socket.

mod connection;
pub mod metrics;
pub mod multiplexer;
pub mod registry;
pub mod server;
pub mod session;

pub use metrics::BridgeMetrics;
pub use multiplexer::{CallMultiplexer, CallStatus, ProtocolViolation};
pub use registry::{SessionRegistry, SessionSummary};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use session::{
    Handshake, Inbound, Session, SessionError, SessionLimits, SessionState,
    CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION,
};
