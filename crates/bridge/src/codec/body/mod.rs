//! Payload encoders, one per framing.

mod chunked_encoder;
mod length_encoder;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use crate::protocol::{PayloadItem, PayloadSize, SendError};

use chunked_encoder::ChunkedEncoder;
use length_encoder::LengthEncoder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// content-length payload
    Length(LengthEncoder),

    /// transfer-encoding chunked payload
    Chunked(ChunkedEncoder),

    /// no body, only the end marker is expected
    NoBody { eof: bool },
}

impl PayloadEncoder {
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody { eof: false } }
    }

    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedEncoder::new()) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthEncoder::new(size)) }
    }

    pub fn is_finish(&self) -> bool {
        match &self.kind {
            Kind::Length(encoder) => encoder.is_finish(),
            Kind::Chunked(encoder) => encoder.is_finish(),
            Kind::NoBody { eof } => *eof,
        }
    }
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(size) => PayloadEncoder::fix_length(size),
            PayloadSize::Chunked => PayloadEncoder::chunked(),
            PayloadSize::Empty => PayloadEncoder::empty(),
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            Kind::Length(encoder) => encoder.encode(item, dst),
            Kind::Chunked(encoder) => encoder.encode(item, dst),
            Kind::NoBody { eof } => match item {
                PayloadItem::Chunk(bytes) if bytes.has_remaining() => Err(SendError::invalid_body("payload written to a response without body")),
                PayloadItem::Chunk(_) => Ok(()),
                PayloadItem::Eof => {
                    *eof = true;
                    Ok(())
                }
            },
        }
    }
}
