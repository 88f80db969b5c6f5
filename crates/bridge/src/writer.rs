//! Draining a standard response onto a [`Writable`].

use std::io;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Response, header};
use futures::FutureExt;
use http_body_util::BodyExt;
use tracing::{debug, error, info, trace};

use crate::cancel::{AbortReason, AbortSignal};
use crate::connection::{Writable, WriteState, drain, end, flush};
use crate::protocol::body::{Payload, ResponseBody};
use crate::protocol::{PayloadSize, SendError};

/// How a response write finished.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// Head and body were written and flushed
    Completed { bytes_written: u64 },
    /// The connection went away first; whatever was already written stays written
    Aborted(AbortReason),
}

impl WriteOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, WriteOutcome::Completed { .. })
    }
}

/// Writes one response: head once, then body chunks in order, then end.
///
/// A streamed body is pulled one frame at a time, and never again before the writable drained
/// after reporting backpressure. Whenever the body has no frame ready, what was written so far is
/// flushed. Every wait races the request's [`AbortSignal`]; once it fires
/// nothing more is pulled or written.
pub struct ResponseWriter<'a, W: ?Sized> {
    writable: &'a mut W,
    signal: &'a AbortSignal,
    omit_body: bool,
    bytes_written: u64,
}

impl<'a, W> ResponseWriter<'a, W>
where
    W: Writable + ?Sized,
{
    pub fn new(writable: &'a mut W, signal: &'a AbortSignal) -> Self {
        Self { writable, signal, omit_body: false, bytes_written: 0 }
    }

    /// Writes the head only, as a response to `HEAD` requires.
    pub fn omit_body(mut self, omit_body: bool) -> Self {
        self.omit_body = omit_body;
        self
    }

    pub async fn write(mut self, response: Response<ResponseBody>) -> Result<WriteOutcome, SendError> {
        if let Some(reason) = self.signal.reason() {
            debug!(%reason, "request aborted before response head, skip writing");
            return Ok(WriteOutcome::Aborted(reason));
        }

        let (mut parts, body) = response.into_parts();
        let declared = declared_length(&parts.headers)?;
        let payload = body.into_payload();

        let payload_size = if self.omit_body {
            if let (None, Payload::Full(bytes)) = (declared, &payload) {
                parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            }
            PayloadSize::Empty
        } else {
            payload_size(&payload, declared)?
        };

        debug!(status = %parts.status, ?payload_size, "write response head");
        if let Err(e) = self.writable.write_head(Response::from_parts(parts, ()), payload_size) {
            return self.io_failure(e);
        }

        if self.omit_body {
            return self.finish(None).await;
        }

        let expected = match payload_size {
            PayloadSize::Length(length) => Some(length),
            PayloadSize::Empty => Some(0),
            PayloadSize::Chunked => None,
        };

        match payload {
            Payload::Empty => self.finish(expected).await,
            Payload::Full(bytes) => match self.write_chunk(bytes, expected) {
                Ok(Some(_)) => self.finish(expected).await,
                Ok(None) => Ok(self.aborted()),
                Err(e) => Err(e),
            },
            Payload::Stream(mut body) => {
                let signal = self.signal;
                loop {
                    if signal.is_aborted() {
                        return Ok(self.aborted());
                    }
                    let frame = match body.frame().now_or_never() {
                        Some(frame) => frame,
                        None => {
                            trace!(bytes_written = self.bytes_written, "response body pending, flush what was written");
                            let flushed = tokio::select! {
                                biased;
                                () = signal.aborted() => return Ok(self.aborted()),
                                flushed = flush(&mut *self.writable) => flushed,
                            };
                            if let Err(e) = flushed {
                                return self.io_failure(e);
                            }
                            tokio::select! {
                                biased;
                                () = signal.aborted() => return Ok(self.aborted()),
                                frame = body.frame() => frame,
                            }
                        }
                    };

                    let data = match frame {
                        None => break,
                        Some(Ok(frame)) => match frame.into_data() {
                            Ok(data) => data,
                            Err(_trailers) => {
                                trace!("drop response trailers");
                                continue;
                            }
                        },
                        Some(Err(e)) => {
                            error!(cause = %e, "response body failed, destroy connection");
                            self.writable.destroy();
                            return Err(SendError::body(e));
                        }
                    };

                    match self.write_chunk(data, expected)? {
                        Some(WriteState::Ready) => {}
                        Some(WriteState::Backpressure) => {
                            trace!(bytes_written = self.bytes_written, "writable reports backpressure, wait for drain");
                            let drained = tokio::select! {
                                biased;
                                () = signal.aborted() => return Ok(self.aborted()),
                                drained = drain(&mut *self.writable) => drained,
                            };
                            if let Err(e) = drained {
                                return self.io_failure(e);
                            }
                        }
                        None => return Ok(self.aborted()),
                    }
                }
                self.finish(expected).await
            }
        }
    }

    /// Writes one chunk. `None` means the request was aborted and nothing was written.
    fn write_chunk(&mut self, data: Bytes, expected: Option<u64>) -> Result<Option<WriteState>, SendError> {
        if self.signal.is_aborted() {
            return Ok(None);
        }
        if data.is_empty() {
            return Ok(Some(WriteState::Ready));
        }

        let written = self.bytes_written + data.len() as u64;
        if let Some(declared) = expected
            && written > declared
        {
            error!(declared, actual = written, "response body longer than declared content-length");
            self.writable.destroy();
            return Err(SendError::length_mismatch(declared, written));
        }

        trace!(size = data.len(), "write response chunk");
        match self.writable.write(data) {
            Ok(state) => {
                self.bytes_written = written;
                Ok(Some(state))
            }
            Err(e) if self.signal.is_aborted() => {
                debug!(cause = %e, "write failed after abort, ignore");
                Ok(None)
            }
            Err(e) => {
                error!(cause = %e, "can't write response chunk");
                self.writable.destroy();
                Err(SendError::io(e))
            }
        }
    }

    async fn finish(mut self, expected: Option<u64>) -> Result<WriteOutcome, SendError> {
        if let Some(declared) = expected
            && declared != self.bytes_written
        {
            error!(declared, actual = self.bytes_written, "response body shorter than declared content-length");
            self.writable.destroy();
            return Err(SendError::length_mismatch(declared, self.bytes_written));
        }

        let signal = self.signal;
        let ended = tokio::select! {
            biased;
            () = signal.aborted() => return Ok(self.aborted()),
            ended = end(&mut *self.writable) => ended,
        };

        match ended {
            Ok(()) => {
                debug!(bytes_written = self.bytes_written, "response completed");
                Ok(WriteOutcome::Completed { bytes_written: self.bytes_written })
            }
            Err(e) => self.io_failure(e),
        }
    }

    /// A failed write is an abort when the connection is already gone, an error otherwise.
    fn io_failure(&mut self, e: io::Error) -> Result<WriteOutcome, SendError> {
        if let Some(reason) = self.signal.reason() {
            debug!(cause = %e, "write failed after abort, ignore");
            return Ok(WriteOutcome::Aborted(reason));
        }

        error!(cause = %e, "can't write response");
        self.writable.destroy();
        Err(SendError::io(e))
    }

    fn aborted(&self) -> WriteOutcome {
        let reason = self.signal.reason().unwrap_or(AbortReason::ClientClosed);
        info!(%reason, bytes_written = self.bytes_written, "stop writing response, request aborted");
        WriteOutcome::Aborted(reason)
    }
}

impl<W: ?Sized> std::fmt::Debug for ResponseWriter<'_, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter").field("omit_body", &self.omit_body).field("bytes_written", &self.bytes_written).finish_non_exhaustive()
    }
}

fn declared_length(headers: &HeaderMap) -> Result<Option<u64>, SendError> {
    let Some(value) = headers.get(header::CONTENT_LENGTH) else {
        return Ok(None);
    };
    let length = value
        .to_str()
        .map_err(SendError::invalid_content_length)?
        .trim()
        .parse::<u64>()
        .map_err(SendError::invalid_content_length)?;
    Ok(Some(length))
}

fn payload_size(payload: &Payload, declared: Option<u64>) -> Result<PayloadSize, SendError> {
    let size = match (payload, declared) {
        (Payload::Empty, None | Some(0)) => PayloadSize::Empty,
        (Payload::Empty, Some(declared)) => return Err(SendError::length_mismatch(declared, 0)),
        (Payload::Full(bytes), Some(declared)) if declared != bytes.len() as u64 => {
            return Err(SendError::length_mismatch(declared, bytes.len() as u64));
        }
        (Payload::Full(bytes), _) if bytes.is_empty() => PayloadSize::Empty,
        (Payload::Full(bytes), _) => PayloadSize::Length(bytes.len() as u64),
        (Payload::Stream(_), Some(declared)) => PayloadSize::Length(declared),
        (Payload::Stream(body), None) => PayloadSize::from(http_body::Body::size_hint(body)),
    };
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationBridge;
    use crate::connection::memory::{MemoryPeer, MemoryWritable, pair, pair_with_high_water_mark};
    use crate::connection::{Lifecycle, RequestHead};
    use crate::protocol::HeaderCaseMap;
    use futures::StreamExt;
    use http::{HeaderName, Method, StatusCode};
    use std::convert::Infallible;

    struct Fixture {
        writable: MemoryWritable,
        peer: MemoryPeer,
        signal: AbortSignal,
        _bridge: CancellationBridge,
        _lifecycle: Lifecycle,
    }

    fn fixture(high_water_mark: Option<usize>) -> Fixture {
        let head = RequestHead::new(Method::GET, "/".parse().unwrap());
        let (connection, peer) = match high_water_mark {
            Some(high_water_mark) => pair_with_high_water_mark(head, high_water_mark),
            None => pair(head),
        };
        let (_, _, lifecycle, writable) = connection.into_parts();
        let bridge = CancellationBridge::attach(&lifecycle);
        Fixture { writable, peer, signal: bridge.signal(), _bridge: bridge, _lifecycle: lifecycle }
    }

    fn chunks(chunks: &[&'static [u8]]) -> ResponseBody {
        let chunks: Vec<Result<Bytes, Infallible>> = chunks.iter().map(|chunk| Ok(Bytes::from_static(chunk))).collect();
        ResponseBody::from_stream(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn writes_full_body_with_original_header_case() {
        let mut f = fixture(None);

        let name = HeaderName::from_static("x-test");
        let mut cases = HeaderCaseMap::new();
        cases.append(&name, Bytes::from_static(b"X-Test"));
        let mut response = Response::builder().status(StatusCode::CREATED).header(&name, "1").body(ResponseBody::from("hello")).unwrap();
        response.extensions_mut().insert(cases);

        let outcome = ResponseWriter::new(&mut f.writable, &f.signal).write(response).await.unwrap();

        assert!(matches!(outcome, WriteOutcome::Completed { bytes_written: 5 }));
        assert_eq!(f.peer.status(), Some(StatusCode::CREATED));
        assert_eq!(f.peer.headers(), vec![("X-Test".to_owned(), "1".to_owned())]);
        assert_eq!(f.peer.payload_size(), Some(PayloadSize::Length(5)));
        assert_eq!(f.peer.finished().await, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn empty_body_ends_immediately() {
        let mut f = fixture(None);

        let outcome = ResponseWriter::new(&mut f.writable, &f.signal).write(Response::new(ResponseBody::empty())).await.unwrap();

        assert!(matches!(outcome, WriteOutcome::Completed { bytes_written: 0 }));
        assert!(f.peer.is_ended());
        assert_eq!(f.peer.write_count(), 0);
        assert_eq!(f.peer.payload_size(), Some(PayloadSize::Empty));
    }

    #[tokio::test]
    async fn stream_waits_for_drain_under_backpressure() {
        let mut f = fixture(Some(4));
        let body = chunks(&[b"abc", b"defg", b"h", b"ijklmn", b"op"]);

        let (outcome, output) = tokio::join!(ResponseWriter::new(&mut f.writable, &f.signal).write(Response::new(body)), f.peer.finished());

        assert!(matches!(outcome.unwrap(), WriteOutcome::Completed { bytes_written: 16 }));
        assert_eq!(output, Bytes::from_static(b"abcdefghijklmnop"));
        assert_eq!(f.peer.write_count(), 5);
        assert_eq!(f.peer.writes_while_backpressured(), 0);
        assert_eq!(f.peer.payload_size(), Some(PayloadSize::Chunked));
    }

    #[tokio::test]
    async fn abort_stops_pulling_the_stream() {
        let mut f = fixture(None);
        let first = futures::stream::once(async { Ok::<_, Infallible>(Bytes::from_static(b"first")) });
        let body = ResponseBody::from_stream(first.chain(futures::stream::pending()));

        let peer = &f.peer;
        let closing = async {
            while peer.write_count() == 0 {
                peer.changed().await;
            }
            peer.close();
        };

        let (outcome, ()) = tokio::join!(ResponseWriter::new(&mut f.writable, &f.signal).write(Response::new(body)), closing);

        assert!(matches!(outcome.unwrap(), WriteOutcome::Aborted(AbortReason::ClientClosed)));
        assert_eq!(f.peer.write_count(), 1);
        assert!(!f.peer.is_ended());
    }

    #[tokio::test]
    async fn flushes_while_body_is_pending() {
        let mut f = fixture(None);
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(1);
        let body = ResponseBody::from_stream(tokio_stream(rx));

        let peer = &f.peer;
        let producing = async move {
            tx.send(Ok(Bytes::from_static(b"tick 0\n"))).await.unwrap();
            while peer.write_count() < 1 || peer.flush_count() < 2 {
                peer.changed().await;
            }
            tx.send(Ok(Bytes::from_static(b"tick 1\n"))).await.unwrap();
        };

        let (outcome, ()) = tokio::join!(ResponseWriter::new(&mut f.writable, &f.signal).write(Response::new(body)), producing);

        assert!(matches!(outcome.unwrap(), WriteOutcome::Completed { bytes_written: 14 }));
        assert!(f.peer.flush_count() >= 2);
        assert!(f.peer.is_ended());
    }

    fn tokio_stream<T: Send + 'static>(mut rx: tokio::sync::mpsc::Receiver<T>) -> impl futures::Stream<Item = T> + Send + 'static {
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
    }

    #[tokio::test]
    async fn already_aborted_writes_nothing() {
        let mut f = fixture(None);
        f.peer.close();

        let outcome = ResponseWriter::new(&mut f.writable, &f.signal).write(Response::new(ResponseBody::from("late"))).await.unwrap();

        assert!(matches!(outcome, WriteOutcome::Aborted(_)));
        assert_eq!(f.peer.status(), None);
    }

    #[tokio::test]
    async fn content_length_mismatch_is_detected_before_writing() {
        let mut f = fixture(None);
        let response = Response::builder().header(header::CONTENT_LENGTH, "3").body(ResponseBody::from("abcd")).unwrap();

        let result = ResponseWriter::new(&mut f.writable, &f.signal).write(response).await;
        assert!(matches!(result, Err(SendError::LengthMismatch { declared: 3, actual: 4 })));
        assert_eq!(f.peer.status(), None);

        let mut f = fixture(None);
        let response = Response::builder().header(header::CONTENT_LENGTH, "4").body(chunks(&[b"ab", b"cde"])).unwrap();

        let result = ResponseWriter::new(&mut f.writable, &f.signal).write(response).await;
        assert!(matches!(result, Err(SendError::LengthMismatch { declared: 4, actual: 5 })));
        assert_eq!(f.peer.bytes_written(), 2);
        assert!(f.peer.is_destroyed());
    }

    #[tokio::test]
    async fn short_stream_is_a_mismatch() {
        let mut f = fixture(None);
        let response = Response::builder().header(header::CONTENT_LENGTH, "10").body(chunks(&[b"abc"])).unwrap();

        let result = ResponseWriter::new(&mut f.writable, &f.signal).write(response).await;
        assert!(matches!(result, Err(SendError::LengthMismatch { declared: 10, actual: 3 })));
        assert!(!f.peer.is_ended());
    }

    #[tokio::test]
    async fn body_error_destroys_writable() {
        let mut f = fixture(None);
        let stream = futures::stream::iter(vec![Ok(Bytes::from_static(b"ok")), Err(io::Error::other("boom"))]);

        let result = ResponseWriter::new(&mut f.writable, &f.signal).write(Response::new(ResponseBody::from_stream(stream))).await;

        assert!(matches!(result, Err(SendError::Body { .. })));
        assert!(f.peer.is_destroyed());
    }

    #[tokio::test]
    async fn head_response_skips_body() {
        let mut f = fixture(None);

        let outcome = ResponseWriter::new(&mut f.writable, &f.signal).omit_body(true).write(Response::new(ResponseBody::from("abc"))).await.unwrap();

        assert!(matches!(outcome, WriteOutcome::Completed { bytes_written: 0 }));
        assert_eq!(f.peer.headers(), vec![("content-length".to_owned(), "3".to_owned())]);
        assert!(f.peer.finished().await.is_empty());
        assert!(f.peer.is_ended());
    }

    #[tokio::test]
    async fn multi_value_headers_pass_through() {
        let mut f = fixture(None);
        let response = Response::builder().header(header::SET_COOKIE, "a=1").header(header::SET_COOKIE, "b=2").body(ResponseBody::empty()).unwrap();

        ResponseWriter::new(&mut f.writable, &f.signal).write(response).await.unwrap();

        assert_eq!(
            f.peer.headers(),
            vec![("set-cookie".to_owned(), "a=1".to_owned()), ("set-cookie".to_owned(), "b=2".to_owned())]
        );
    }
}
