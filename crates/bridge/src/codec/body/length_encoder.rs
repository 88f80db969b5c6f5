use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use crate::protocol::{PayloadItem, SendError};

/// Writes a `content-length` body, refusing to write more or end with less than declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    declared: u64,
    written: u64,
    eof: bool,
}

impl LengthEncoder {
    pub fn new(declared: u64) -> Self {
        Self { declared, written: 0, eof: false }
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(bytes) => {
                let written = self.written + bytes.remaining() as u64;
                if written > self.declared {
                    return Err(SendError::length_mismatch(self.declared, written));
                }
                dst.extend_from_slice(bytes.chunk());
                self.written = written;
                Ok(())
            }
            PayloadItem::Eof => {
                if self.written != self.declared {
                    return Err(SendError::length_mismatch(self.declared, self.written));
                }
                self.eof = true;
                Ok(())
            }
        }
    }
}
