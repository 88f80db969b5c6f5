use std::io::Write;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use crate::codec::header::FastWrite;
use crate::protocol::{PayloadItem, SendError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkedEncoder {
    eof: bool,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self { eof: false }
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Err(SendError::invalid_body("payload item after the last chunk"));
        }

        match item {
            PayloadItem::Chunk(bytes) => {
                // a zero-sized chunk would terminate the body
                if !bytes.has_remaining() {
                    return Ok(());
                }
                write!(FastWrite(dst), "{:X}\r\n", bytes.remaining())?;
                dst.reserve(bytes.remaining() + 2);
                dst.extend_from_slice(bytes.chunk());
                dst.extend_from_slice(b"\r\n");
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                dst.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn frames_chunks() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"hello world!")), &mut dst).unwrap();
        encoder.encode(PayloadItem::Chunk(Bytes::new()), &mut dst).unwrap();
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();

        assert!(encoder.is_finish());
        assert_eq!(&dst[..], b"C\r\nhello world!\r\n0\r\n\r\n");
    }
}
