use bytes::Bytes;

use crate::ids::CallId;
use crate::status::{CallFailure, StatusCode};

/// A framed unit of the bridge wire protocol.
///
/// The first four variants travel client → bridge, the last two
/// bridge → client. Every variant after `CallOpen` refers to a call by the
/// identifier the client chose when opening it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    CallOpen {
        id: CallId,
        service: String,
        method: String,
        payload: Option<Bytes>,
    },
    CallData {
        id: CallId,
        payload: Bytes,
    },
    CallEnd {
        id: CallId,
    },
    CallCancel {
        id: CallId,
    },
    ResultData {
        id: CallId,
        payload: Bytes,
    },
    ResultStatus {
        id: CallId,
        code: StatusCode,
        message: String,
    },
}

impl Envelope {
    pub fn call_id(&self) -> CallId {
        match self {
            Self::CallOpen { id, .. }
            | Self::CallData { id, .. }
            | Self::CallEnd { id }
            | Self::CallCancel { id }
            | Self::ResultData { id, .. }
            | Self::ResultStatus { id, .. } => *id,
        }
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CallOpen { .. } => "call_open",
            Self::CallData { .. } => "call_data",
            Self::CallEnd { .. } => "call_end",
            Self::CallCancel { .. } => "call_cancel",
            Self::ResultData { .. } => "result_data",
            Self::ResultStatus { .. } => "result_status",
        }
    }

    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            Self::CallOpen { .. } | Self::CallData { .. } | Self::CallEnd { .. } | Self::CallCancel { .. }
        )
    }

    pub fn is_status(&self) -> bool {
        matches!(self, Self::ResultStatus { .. })
    }

    pub fn status(id: CallId, code: StatusCode, message: impl Into<String>) -> Self {
        Self::ResultStatus {
            id,
            code,
            message: message.into(),
        }
    }

    pub fn ok(id: CallId) -> Self {
        Self::status(id, StatusCode::Ok, "")
    }

    pub fn cancelled(id: CallId) -> Self {
        Self::status(id, StatusCode::Cancelled, "cancelled by client")
    }

    pub fn method_not_found(id: CallId, service: &str, method: &str) -> Self {
        Self::status(
            id,
            StatusCode::MethodNotFound,
            format!("Method not found: {service}/{method}"),
        )
    }

    pub fn failed(id: CallId, failure: &CallFailure) -> Self {
        Self::status(id, failure.status(), failure.message.clone())
    }
}
