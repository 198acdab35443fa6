//! Fixed-layout envelope codec for the control socket.
//!
//! Frame format, big-endian:
//! ```text
//! +----------+--------+--------+----------+-------------+-----------+
//! | msg_type |  pid   |  uid   |  result  | payload_len |  payload  |
//! |  u32     |  i32   |  u32   |  i32     |  u32        |  N bytes  |
//! +----------+--------+--------+----------+-------------+-----------+
//! ```
//!
//! The reply direction is not enveloped: a response is exactly one
//! big-endian `i32` status code.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Envelope, MessageType};

/// Hard maximum for an envelope payload. A payload of exactly this size is
/// valid; anything longer is rejected before it reaches a socket.
pub const MAX_PAYLOAD_SIZE: usize = 8192;

/// Fixed header size in bytes.
const HEADER_SIZE: usize = 20;

/// Codec for control-socket request envelopes.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    pending: Option<PendingHeader>,
}

#[derive(Debug, Clone, Copy)]
struct PendingHeader {
    msg_type: MessageType,
    pid: i32,
    uid: u32,
    result: i32,
    payload_len: usize,
}

impl EnvelopeCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let raw_type = src.get_u32();
            let Some(msg_type) = MessageType::from_wire(raw_type) else {
                return Err(CodecError::InvalidMessageType(raw_type));
            };
            let pid = src.get_i32();
            let uid = src.get_u32();
            let result = src.get_i32();
            let payload_len = src.get_u32() as usize;

            // The embedded length is never trusted past the hard maximum.
            if payload_len > MAX_PAYLOAD_SIZE {
                return Err(CodecError::PayloadTooLarge(payload_len));
            }

            self.pending = Some(PendingHeader {
                msg_type,
                pid,
                uid,
                result,
                payload_len,
            });
        }

        let Some(header) = self.pending else {
            return Ok(None);
        };

        if src.len() < header.payload_len {
            src.reserve(header.payload_len - src.len());
            return Ok(None);
        }

        let payload = src.split_to(header.payload_len).to_vec();
        self.pending = None;

        Ok(Some(Envelope {
            msg_type: header.msg_type,
            pid: header.pid,
            uid: header.uid,
            result: header.result,
            payload,
        }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    // Payload size is checked against MAX_PAYLOAD_SIZE (fits in u32)
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(item.payload.len()));
        }

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_u32(item.msg_type.wire_value());
        dst.put_i32(item.pid);
        dst.put_u32(item.uid);
        dst.put_i32(item.result);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

/// Errors that can occur during codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u32),

    #[error("payload too large: {0} bytes (max: {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope(payload: Vec<u8>) -> Envelope {
        Envelope {
            msg_type: MessageType::ClientSet,
            pid: 4321,
            uid: 1000,
            result: 0,
            payload,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let envelope = sample_envelope(b"hello".to_vec());
        codec.encode(envelope.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(sample_envelope(Vec::new()), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_boundary_payload_accepted() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let envelope = sample_envelope(vec![0xab; MAX_PAYLOAD_SIZE]);
        codec.encode(envelope, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let envelope = sample_envelope(vec![0; MAX_PAYLOAD_SIZE + 1]);
        let result = codec.encode(envelope, &mut buf);
        assert!(matches!(result, Err(CodecError::PayloadTooLarge(_))));
        assert!(buf.is_empty(), "nothing may be written on rejection");
    }

    #[test]
    fn test_decode_rejects_oversize_length() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        buf.put_u32(MessageType::DbUpdate.wire_value());
        buf.put_i32(1);
        buf.put_u32(0);
        buf.put_i32(0);
        buf.put_u32(u32::try_from(MAX_PAYLOAD_SIZE + 1).unwrap());

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::PayloadTooLarge(_))));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        buf.put_u32(17);
        buf.put_i32(1);
        buf.put_u32(0);
        buf.put_i32(0);
        buf.put_u32(0);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::InvalidMessageType(17))));
    }

    #[test]
    fn test_partial_decode() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(sample_envelope(b"partial".to_vec()), &mut buf)
            .unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..HEADER_SIZE - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[HEADER_SIZE - 3..HEADER_SIZE + 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[HEADER_SIZE + 2..]);
        let decoded = codec.decode(&mut partial).unwrap();
        assert!(decoded.is_some());
        assert_eq!(decoded.unwrap().payload, b"partial");
    }

    #[test]
    fn test_decode_empty_buffer() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_two_envelopes_in_buffer() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(sample_envelope(b"first".to_vec()), &mut buf)
            .unwrap();
        codec
            .encode(sample_envelope(b"second".to_vec()), &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().payload, b"first");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().payload, b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::PayloadTooLarge(9000);
        assert!(err.to_string().contains("9000"));
        assert!(err.to_string().contains("8192"));

        let err = CodecError::InvalidMessageType(9);
        assert!(err.to_string().contains("invalid message type"));
    }
}
