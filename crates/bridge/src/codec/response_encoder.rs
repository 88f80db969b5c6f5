use std::io;
use std::io::ErrorKind;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadSize, ResponseHead, SendError};

/// Encodes one response after another: a head, its payload items, then the next head.
#[derive(Debug)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// True between a head and the end of its payload.
    pub fn in_payload(&self) -> bool {
        self.payload_encoder.is_some()
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self { header_encoder: HeaderEncoder, payload_encoder: None }
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                self.header_encoder.encode((head, payload_size), dst)?;
                self.payload_encoder = Some(PayloadEncoder::from(payload_size));
                Ok(())
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("expect response header but receive payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let result = payload_encoder.encode(payload_item, dst);
                if payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }
                result
            }
        }
    }
}
