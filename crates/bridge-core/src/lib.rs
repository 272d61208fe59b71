pub mod codec;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod status;

pub use codec::{decode, encode, EnvelopeCodec, DEFAULT_MAX_FRAME_LEN};
pub use envelope::Envelope;
pub use errors::DecodeError;
pub use ids::{CallId, SessionId};
pub use status::{CallFailure, StatusCode};
