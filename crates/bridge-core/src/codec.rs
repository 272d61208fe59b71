//! Length-prefixed binary encoding of [`Envelope`]s.
//!
//! ```text
//! frame   := len:u32 body[len]
//! body    := tag:u8 id:u64 fields
//! bytes   := len:u32 data[len]
//!
//! 1 CallOpen     service:bytes method:bytes has_payload:u8 [payload:bytes]
//! 2 CallData     payload:bytes
//! 3 CallEnd
//! 4 CallCancel
//! 5 ResultData   payload:bytes
//! 6 ResultStatus code:u8 [backend_code:u32 if code = 3] message:bytes
//! ```
//!
//! All integers are big-endian. Payloads are opaque and never escaped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::errors::DecodeError;
use crate::ids::CallId;
use crate::status::StatusCode;

pub const FRAME_LEN_PREFIX_SIZE: usize = 4;
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const TAG_CALL_OPEN: u8 = 1;
const TAG_CALL_DATA: u8 = 2;
const TAG_CALL_END: u8 = 3;
const TAG_CALL_CANCEL: u8 = 4;
const TAG_RESULT_DATA: u8 = 5;
const TAG_RESULT_STATUS: u8 = 6;

const HEADER_LEN: usize = 1 + 8;
const LEN_FIELD: usize = 4;

/// Encode one envelope as a complete frame.
pub fn encode(envelope: &Envelope) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_LEN_PREFIX_SIZE + body_len(envelope));
    encode_into(envelope, &mut buf);
    buf.freeze()
}

/// Append one framed envelope to `dst`.
pub fn encode_into(envelope: &Envelope, dst: &mut BytesMut) {
    let len = body_len(envelope);
    dst.reserve(FRAME_LEN_PREFIX_SIZE + len);
    dst.put_u32(len as u32);

    match envelope {
        Envelope::CallOpen {
            id,
            service,
            method,
            payload,
        } => {
            put_header(dst, TAG_CALL_OPEN, *id);
            put_bytes(dst, service.as_bytes());
            put_bytes(dst, method.as_bytes());
            match payload {
                Some(p) => {
                    dst.put_u8(1);
                    put_bytes(dst, p);
                }
                None => dst.put_u8(0),
            }
        }
        Envelope::CallData { id, payload } => {
            put_header(dst, TAG_CALL_DATA, *id);
            put_bytes(dst, payload);
        }
        Envelope::CallEnd { id } => put_header(dst, TAG_CALL_END, *id),
        Envelope::CallCancel { id } => put_header(dst, TAG_CALL_CANCEL, *id),
        Envelope::ResultData { id, payload } => {
            put_header(dst, TAG_RESULT_DATA, *id);
            put_bytes(dst, payload);
        }
        Envelope::ResultStatus { id, code, message } => {
            put_header(dst, TAG_RESULT_STATUS, *id);
            dst.put_u8(code.wire_tag());
            if let StatusCode::BackendError(backend_code) = code {
                dst.put_u32(*backend_code);
            }
            put_bytes(dst, message.as_bytes());
        }
    }
}

/// Decode exactly one frame. The input must hold the length prefix and a
/// body of precisely that length.
pub fn decode(src: &[u8]) -> Result<Envelope, DecodeError> {
    let mut buf = src;
    let declared = read_u32(&mut buf, "frame length")? as usize;
    if declared != buf.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }
    decode_body(buf)
}

/// Decode a frame body (everything after the length prefix).
pub fn decode_body(mut buf: &[u8]) -> Result<Envelope, DecodeError> {
    let tag = read_u8(&mut buf, "tag")?;
    let id = CallId(read_u64(&mut buf, "call id")?);

    let envelope = match tag {
        TAG_CALL_OPEN => {
            let service = read_string(&mut buf, "service")?;
            let method = read_string(&mut buf, "method")?;
            let payload = match read_u8(&mut buf, "payload flag")? {
                0 => None,
                1 => Some(read_bytes(&mut buf, "payload")?),
                other => return Err(DecodeError::InvalidFlag(other)),
            };
            Envelope::CallOpen {
                id,
                service,
                method,
                payload,
            }
        }
        TAG_CALL_DATA => Envelope::CallData {
            id,
            payload: read_bytes(&mut buf, "payload")?,
        },
        TAG_CALL_END => Envelope::CallEnd { id },
        TAG_CALL_CANCEL => Envelope::CallCancel { id },
        TAG_RESULT_DATA => Envelope::ResultData {
            id,
            payload: read_bytes(&mut buf, "payload")?,
        },
        TAG_RESULT_STATUS => {
            let code = match read_u8(&mut buf, "status code")? {
                StatusCode::TAG_OK => StatusCode::Ok,
                StatusCode::TAG_CANCELLED => StatusCode::Cancelled,
                StatusCode::TAG_METHOD_NOT_FOUND => StatusCode::MethodNotFound,
                StatusCode::TAG_BACKEND_ERROR => {
                    StatusCode::BackendError(read_u32(&mut buf, "backend code")?)
                }
                other => return Err(DecodeError::UnknownStatus(other)),
            };
            let message = read_string(&mut buf, "message")?;
            Envelope::ResultStatus { id, code, message }
        }
        other => return Err(DecodeError::UnknownTag(other)),
    };

    if !buf.is_empty() {
        return Err(DecodeError::TrailingBytes(buf.len()));
    }
    Ok(envelope)
}

fn body_len(envelope: &Envelope) -> usize {
    HEADER_LEN
        + match envelope {
            Envelope::CallOpen {
                service,
                method,
                payload,
                ..
            } => {
                LEN_FIELD * 2
                    + service.len()
                    + method.len()
                    + 1
                    + payload.as_ref().map_or(0, |p| LEN_FIELD + p.len())
            }
            Envelope::CallData { payload, .. } | Envelope::ResultData { payload, .. } => {
                LEN_FIELD + payload.len()
            }
            Envelope::CallEnd { .. } | Envelope::CallCancel { .. } => 0,
            Envelope::ResultStatus { code, message, .. } => {
                let backend = if matches!(code, StatusCode::BackendError(_)) { 4 } else { 0 };
                1 + backend + LEN_FIELD + message.len()
            }
        }
}

fn put_header(dst: &mut BytesMut, tag: u8, id: CallId) {
    dst.put_u8(tag);
    dst.put_u64(id.get());
}

fn put_bytes(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32(data.len() as u32);
    dst.put_slice(data);
}

fn ensure(buf: &[u8], field: &'static str, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            field,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn read_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, DecodeError> {
    ensure(buf, field, 1)?;
    Ok(buf.get_u8())
}

fn read_u32(buf: &mut &[u8], field: &'static str) -> Result<u32, DecodeError> {
    ensure(buf, field, 4)?;
    Ok(buf.get_u32())
}

fn read_u64(buf: &mut &[u8], field: &'static str) -> Result<u64, DecodeError> {
    ensure(buf, field, 8)?;
    Ok(buf.get_u64())
}

fn read_bytes(buf: &mut &[u8], field: &'static str) -> Result<Bytes, DecodeError> {
    let len = read_u32(buf, field)? as usize;
    ensure(buf, field, len)?;
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(out)
}

fn read_string(buf: &mut &[u8], field: &'static str) -> Result<String, DecodeError> {
    let raw = read_bytes(buf, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { field })
}

/// Streaming codec for byte-stream transports (TCP, Unix sockets).
#[derive(Clone, Debug)]
pub struct EnvelopeCodec {
    max_frame_len: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, DecodeError> {
        if src.len() < FRAME_LEN_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let frame_end = FRAME_LEN_PREFIX_SIZE + len;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }
        let frame = src.split_to(frame_end);
        decode_body(&frame[FRAME_LEN_PREFIX_SIZE..]).map(Some)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = DecodeError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), DecodeError> {
        Encoder::<&Envelope>::encode(self, &item, dst)
    }
}

impl Encoder<&Envelope> for EnvelopeCodec {
    type Error = DecodeError;

    fn encode(&mut self, item: &Envelope, dst: &mut BytesMut) -> Result<(), DecodeError> {
        let len = body_len(item);
        if len > self.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        encode_into(item, dst);
        Ok(())
    }
}
