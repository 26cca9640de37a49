//! HTTP Capsule framing (RFC 9297) for UDP proxying
//!
//! A capsule is `varint(type) varint(length) value`. UDP payloads travel in
//! DATAGRAM capsules whose value is `varint(context id) payload`. On HTTP/3
//! the same context-prefixed payload is sent as a QUIC datagram, preceded by
//! the quarter stream id of the request that owns it.

use crate::varint;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Capsule type carrying an HTTP Datagram
pub const DATAGRAM_CAPSULE_TYPE: u64 = 0;

/// Context id of plain UDP payloads
pub const DEFAULT_CONTEXT_ID: u64 = 0;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Capsule too large: {0} bytes")]
    CapsuleTooLarge(u64),

    #[error("Value does not fit in a varint: {0}")]
    VarintOverflow(u64),

    #[error("Truncated datagram")]
    Truncated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single decoded capsule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capsule {
    pub capsule_type: u64,
    pub value: Bytes,
}

impl Capsule {
    /// DATAGRAM capsule wrapping `payload` in the default context
    pub fn datagram(payload: &[u8]) -> Self {
        Self {
            capsule_type: DATAGRAM_CAPSULE_TYPE,
            value: encode_context_payload(DEFAULT_CONTEXT_ID, payload),
        }
    }

    pub fn is_datagram(&self) -> bool {
        self.capsule_type == DATAGRAM_CAPSULE_TYPE
    }
}

/// Capsule stream codec
///
/// DATAGRAM capsules are limited to [`CapsuleCodec::MAX_VALUE_SIZE`].
/// Capsules of other types over that size are discarded as they arrive.
#[derive(Debug, Clone, Default)]
pub struct CapsuleCodec {
    /// Bytes of an oversized unknown capsule still to discard
    skipping: u64,
}

impl CapsuleCodec {
    /// Maximum DATAGRAM capsule value size (a full UDP payload plus its
    /// context id)
    pub const MAX_VALUE_SIZE: usize = crate::MAX_UDP_PACKET_SIZE + 8;

    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a capsule onto `buf`
    pub fn encode(capsule: &Capsule, buf: &mut BytesMut) -> Result<(), CodecError> {
        if capsule.is_datagram() && capsule.value.len() > Self::MAX_VALUE_SIZE {
            return Err(CodecError::CapsuleTooLarge(capsule.value.len() as u64));
        }

        buf.reserve(16 + capsule.value.len());
        if !varint::encode(capsule.capsule_type, buf) {
            return Err(CodecError::VarintOverflow(capsule.capsule_type));
        }
        varint::encode(capsule.value.len() as u64, buf);
        buf.extend_from_slice(&capsule.value);
        Ok(())
    }

    /// Discard what is left of an oversized capsule; true once it is gone
    fn skip(&mut self, buf: &mut BytesMut) -> bool {
        let n = self.skipping.min(buf.len() as u64);
        buf.advance(n as usize);
        self.skipping -= n;
        self.skipping == 0
    }
}

impl Decoder for CapsuleCodec {
    type Item = Capsule;
    type Error = CodecError;

    /// Decode a capsule from the front of `src`
    ///
    /// Returns Ok(Some(capsule)) if a complete capsule was decoded,
    /// Ok(None) if more data is needed,
    /// Err if a DATAGRAM capsule declares a length over the limit
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Capsule>, CodecError> {
        loop {
            if !self.skip(src) {
                return Ok(None);
            }

            let Some((capsule_type, type_len)) = varint::decode(src) else {
                return Ok(None);
            };
            let Some((length, length_len)) = varint::decode(&src[type_len..]) else {
                return Ok(None);
            };
            let header_len = type_len + length_len;

            if length > Self::MAX_VALUE_SIZE as u64 {
                if capsule_type == DATAGRAM_CAPSULE_TYPE {
                    return Err(CodecError::CapsuleTooLarge(length));
                }
                tracing::debug!(capsule_type, length, "skipping oversized capsule");
                src.advance(header_len);
                self.skipping = length;
                continue;
            }

            let total = header_len + length as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(header_len);
            let value = src.split_to(length as usize).freeze();

            return Ok(Some(Capsule {
                capsule_type,
                value,
            }));
        }
    }
}

impl Encoder<Capsule> for CapsuleCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Capsule, dst: &mut BytesMut) -> Result<(), CodecError> {
        CapsuleCodec::encode(&item, dst)
    }
}

/// Prefix `payload` with a context id
pub fn encode_context_payload(context_id: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    varint::encode(context_id, &mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Split a datagram value into its context id and payload
pub fn decode_context_payload(mut value: Bytes) -> Result<(u64, Bytes), CodecError> {
    let (context_id, len) = varint::decode(&value).ok_or(CodecError::Truncated)?;
    value.advance(len);
    Ok((context_id, value))
}

/// Frame a UDP payload as an HTTP/3 datagram
///
/// Format: [quarter stream id: varint][context id: varint][payload]
pub fn encode_quic_datagram(quarter_stream_id: u64, payload: &[u8]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(16 + payload.len());
    if !varint::encode(quarter_stream_id, &mut buf) {
        return Err(CodecError::VarintOverflow(quarter_stream_id));
    }
    varint::encode(DEFAULT_CONTEXT_ID, &mut buf);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Parse an HTTP/3 datagram into (quarter stream id, context id, payload)
pub fn decode_quic_datagram(mut datagram: Bytes) -> Result<(u64, u64, Bytes), CodecError> {
    let (quarter_stream_id, len) = varint::decode(&datagram).ok_or(CodecError::Truncated)?;
    datagram.advance(len);
    let (context_id, payload) = decode_context_payload(datagram)?;
    Ok((quarter_stream_id, context_id, payload))
}
