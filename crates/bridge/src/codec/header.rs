//! Status line and header serialization.

use std::io;
use std::io::{ErrorKind, Write};

use bytes::{BufMut, BytesMut};
use http::{HeaderValue, Version, header};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::protocol::{HeaderCaseMap, PayloadSize, ResponseHead, SendError};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encodes a [`ResponseHead`], replacing any framing headers with the ones `PayloadSize` implies.
///
/// Header names are written with the spelling recorded in the head's [`HeaderCaseMap`] extension,
/// if there is one.
#[derive(Debug)]
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;

        dst.reserve(INIT_HEADER_SIZE);
        let version = match head.version() {
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_10 => "HTTP/1.0",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported).into());
            }
        };
        let status = head.status();
        write!(FastWrite(dst), "{} {} {}\r\n", version, status.as_str(), status.canonical_reason().unwrap_or(""))?;

        let headers = head.headers_mut();
        match payload_size {
            PayloadSize::Length(n) => {
                headers.remove(header::TRANSFER_ENCODING);
                headers.insert(header::CONTENT_LENGTH, n.into());
            }
            PayloadSize::Chunked => {
                headers.remove(header::CONTENT_LENGTH);
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
            // a declared framing header is kept as is, a HEAD response relies on it
            PayloadSize::Empty => {
                if !headers.contains_key(header::CONTENT_LENGTH) && !headers.contains_key(header::TRANSFER_ENCODING) {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                }
            }
        }

        let cases = head.extensions().get::<HeaderCaseMap>().cloned().unwrap_or_default();
        for (name, value) in cases.cased(head.headers()) {
            dst.put_slice(name);
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Writes into a `BytesMut` that already reserved room.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderName, Response, StatusCode};

    fn encode(head: ResponseHead, payload_size: PayloadSize) -> String {
        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, payload_size), &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn writes_recorded_casing() {
        let name = HeaderName::from_static("x-test");
        let mut cases = HeaderCaseMap::new();
        cases.append(&name, Bytes::from_static(b"X-Test"));

        let mut head = Response::builder().status(StatusCode::CREATED).header(&name, "1").body(()).unwrap();
        head.extensions_mut().insert(cases);

        assert_eq!(encode(head, PayloadSize::Length(3)), "HTTP/1.1 201 Created\r\nX-Test: 1\r\ncontent-length: 3\r\n\r\n");
    }

    #[test]
    fn chunked_replaces_declared_length() {
        let head = Response::builder().header(header::CONTENT_LENGTH, "10").body(()).unwrap();
        assert_eq!(encode(head, PayloadSize::Chunked), "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n");
    }

    #[test]
    fn empty_keeps_declared_length() {
        let head = Response::builder().header(header::CONTENT_LENGTH, "10").body(()).unwrap();
        assert_eq!(encode(head, PayloadSize::Empty), "HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\n");

        assert_eq!(encode(Response::new(()), PayloadSize::Empty), "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
    }

    #[test]
    fn rejects_http2() {
        let head = Response::builder().version(Version::HTTP_2).body(()).unwrap();
        let mut dst = BytesMut::new();
        assert!(matches!(HeaderEncoder.encode((head, PayloadSize::Empty), &mut dst), Err(SendError::Io { .. })));
    }
}
