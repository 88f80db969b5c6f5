//! HTTP/1.1 response framing for hosts writing to a byte stream.
//!
//! The bridge itself never frames anything: a [`Writable`](crate::connection::Writable) receives a
//! [`ResponseHead`](crate::protocol::ResponseHead) and raw chunks. Hosts that sit on a plain
//! `AsyncWrite` use [`ResponseEncoder`] (through [`IoWritable`](crate::connection::io::IoWritable))
//! to turn those into wire bytes.
//!
//! # Components
//!
//! - [`ResponseEncoder`]: encodes a head followed by payload items
//! - `header`: status line and headers, original casing kept, framing header set from the payload size
//! - `body`: `content-length` and `transfer-encoding: chunked` payload encoders
//!
//! # Example
//!
//! ```
//! use bytes::{Bytes, BytesMut};
//! use http::Response;
//! use micro_bridge::codec::ResponseEncoder;
//! use micro_bridge::protocol::{Message, PayloadItem, PayloadSize, ResponseHead};
//! use tokio_util::codec::Encoder;
//!
//! type Item = Message<(ResponseHead, PayloadSize)>;
//!
//! let mut encoder = ResponseEncoder::new();
//! let mut dst = BytesMut::new();
//!
//! encoder.encode(Item::Header((Response::new(()), PayloadSize::Length(2))), &mut dst).unwrap();
//! encoder.encode(Item::Payload(PayloadItem::Chunk(Bytes::from_static(b"ok"))), &mut dst).unwrap();
//! encoder.encode(Item::Payload(PayloadItem::Eof), &mut dst).unwrap();
//!
//! assert_eq!(&dst[..], b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok");
//! ```

mod body;
mod header;
mod response_encoder;

pub use response_encoder::ResponseEncoder;
