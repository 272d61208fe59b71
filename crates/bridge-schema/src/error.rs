/// Why a client-supplied schema could not be loaded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("invalid JSON schema: {0}")]
    Json(String),
    #[error("invalid schema at `{path}`: {message}")]
    Invalid { path: String, message: String },
    #[error("duplicate key `{key}` in `{path}`")]
    DuplicateKey { path: String, key: String },
    #[error("duplicate method {service}/{method}")]
    DuplicateMethod { service: String, method: String },
    #[error("schema declares no services")]
    NoServices,
}

impl SchemaError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "syntax",
            Self::Json(_) => "json",
            Self::Invalid { .. } => "invalid",
            Self::DuplicateKey { .. } => "duplicate_key",
            Self::DuplicateMethod { .. } => "duplicate_method",
            Self::NoServices => "no_services",
        }
    }
}

impl From<serde_json::Error> for SchemaError {
    fn from(e: serde_json::Error) -> Self {
        SchemaError::Json(e.to_string())
    }
}
