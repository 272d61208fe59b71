use serde::{Deserialize, Serialize};

// Backend status codes (gRPC numbering, carried inside `StatusCode::BackendError`)
pub const CANCELLED: u32 = 1;
pub const UNKNOWN: u32 = 2;
pub const INVALID_ARGUMENT: u32 = 3;
pub const DEADLINE_EXCEEDED: u32 = 4;
pub const NOT_FOUND: u32 = 5;
pub const RESOURCE_EXHAUSTED: u32 = 8;
pub const UNIMPLEMENTED: u32 = 12;
pub const INTERNAL: u32 = 13;
pub const UNAVAILABLE: u32 = 14;
/// Bridge-local code outside the gRPC range. A failure carrying it is
/// reported as `StatusCode::MethodNotFound` rather than a backend error.
pub const METHOD_NOT_FOUND: u32 = 0x1_0000;

/// Map a numeric backend code to a short name for logs and metrics.
pub fn backend_code_name(code: u32) -> &'static str {
    match code {
        0 => "OK",
        CANCELLED => "CANCELLED",
        UNKNOWN => "UNKNOWN",
        INVALID_ARGUMENT => "INVALID_ARGUMENT",
        DEADLINE_EXCEEDED => "DEADLINE_EXCEEDED",
        NOT_FOUND => "NOT_FOUND",
        RESOURCE_EXHAUSTED => "RESOURCE_EXHAUSTED",
        UNIMPLEMENTED => "UNIMPLEMENTED",
        INTERNAL => "INTERNAL",
        UNAVAILABLE => "UNAVAILABLE",
        METHOD_NOT_FOUND => "METHOD_NOT_FOUND",
        _ => "UNRECOGNIZED",
    }
}

/// Terminal status reported to the client in `ResultStatus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Cancelled,
    MethodNotFound,
    /// The backend failed the call; carries the backend's own code.
    BackendError(u32),
}

impl StatusCode {
    pub const TAG_OK: u8 = 0;
    pub const TAG_CANCELLED: u8 = 1;
    pub const TAG_METHOD_NOT_FOUND: u8 = 2;
    pub const TAG_BACKEND_ERROR: u8 = 3;

    pub fn wire_tag(&self) -> u8 {
        match self {
            Self::Ok => Self::TAG_OK,
            Self::Cancelled => Self::TAG_CANCELLED,
            Self::MethodNotFound => Self::TAG_METHOD_NOT_FOUND,
            Self::BackendError(_) => Self::TAG_BACKEND_ERROR,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Short label for logging/metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Cancelled => "cancelled",
            Self::MethodNotFound => "method_not_found",
            Self::BackendError(_) => "backend_error",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackendError(code) => write!(f, "backend_error({})", backend_code_name(*code)),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A backend-reported call failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallFailure {
    pub code: u32,
    pub message: String,
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", backend_code_name(self.code), self.code, self.message)
    }
}

impl std::error::Error for CallFailure {}

impl CallFailure {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(UNAVAILABLE, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(UNIMPLEMENTED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL, message)
    }

    /// The backend does not know the method the bridge resolved.
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(METHOD_NOT_FOUND, message)
    }

    /// Failure synthesized when a backend drops a call without a terminal event.
    pub fn dropped() -> Self {
        Self::new(INTERNAL, "backend dropped call without a terminal status")
    }

    pub fn status(&self) -> StatusCode {
        match self.code {
            METHOD_NOT_FOUND => StatusCode::MethodNotFound,
            code => StatusCode::BackendError(code),
        }
    }
}
