use std::time::Duration;

/// Failure to establish or keep a backend connection for a session.
///
/// Per-call failures never use this type; they travel as
/// [`BackendEvent::Failed`](crate::BackendEvent::Failed).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("failed to connect to {addr}: {message}")]
    Connect { addr: String, message: String },
    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Timeout { .. } => "timeout",
            Self::Unavailable(_) => "unavailable",
        }
    }
}
