/// Failure to decode bytes into an [`Envelope`](crate::envelope::Envelope).
///
/// Decoding never panics; every malformed or truncated input maps to one of
/// these variants.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated {field}: need {needed} bytes, have {available}")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("frame length {declared} does not match body of {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("unknown envelope tag {0}")]
    UnknownTag(u8),
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
    #[error("invalid payload flag {0}")]
    InvalidFlag(u8),
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("{0} trailing bytes after envelope body")]
    TrailingBytes(usize),
    #[error("io error: {0}")]
    Io(String),
}

impl DecodeError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::LengthMismatch { .. } => "length_mismatch",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::UnknownTag(_) => "unknown_tag",
            Self::UnknownStatus(_) => "unknown_status",
            Self::InvalidFlag(_) => "invalid_flag",
            Self::InvalidUtf8 { .. } => "invalid_utf8",
            Self::TrailingBytes(_) => "trailing_bytes",
            Self::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        DecodeError::Io(e.to_string())
    }
}
