use serde::{Deserialize, Serialize};

/// Streaming shape of a method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl Cardinality {
    pub fn from_flags(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => Self::Unary,
            (true, false) => Self::ClientStreaming,
            (false, true) => Self::ServerStreaming,
            (true, true) => Self::BidiStreaming,
        }
    }

    /// Whether the client may send messages after the initial payload.
    pub fn client_streams(&self) -> bool {
        matches!(self, Self::ClientStreaming | Self::BidiStreaming)
    }

    pub fn server_streams(&self) -> bool {
        matches!(self, Self::ServerStreaming | Self::BidiStreaming)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ClientStreaming => "client_streaming",
            Self::ServerStreaming => "server_streaming",
            Self::BidiStreaming => "bidi_streaming",
        }
    }
}

/// One callable method as declared by a client-supplied schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDescriptor {
    /// Package-qualified service name, e.g. `demo.Echo`.
    pub service: String,
    pub method: String,
    pub cardinality: Cardinality,
    pub request_type: String,
    pub response_type: String,
}

impl MethodDescriptor {
    /// `service/method`, the form used in logs and metric labels.
    pub fn route(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }
}

/// A service and its methods as produced by one of the schema parsers.
#[derive(Clone, Debug)]
pub(crate) struct ServiceDef {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

/// Resolve a type reference against the namespace it was written in.
///
/// A leading dot marks an absolute name; dotted names are taken as already
/// qualified; bare names are prefixed with the enclosing namespace.
pub(crate) fn qualify_type(namespace: &str, name: &str) -> String {
    if let Some(absolute) = name.strip_prefix('.') {
        absolute.to_string()
    } else if name.contains('.') || namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}
