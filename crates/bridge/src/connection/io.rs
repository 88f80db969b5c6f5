//! Glue for hosts sitting on tokio byte streams.
//!
//! [`connection`] wires an `AsyncWrite` into a [`Connection`] through [`IoWritable`], which frames
//! responses as HTTP/1.1 and reports write failures to the connection's lifecycle.
//! [`ConnectionHandle::read_from`] feeds the request body from the read half and then keeps
//! reading, so a peer that goes away aborts the request.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::codec::{BytesCodec, Encoder, FramedRead};
use tracing::{debug, error, trace};

use crate::codec::ResponseEncoder;
use crate::connection::{Connection, ConnectionHandle, Lifecycle, RequestHead, Writable, WriteState};
use crate::protocol::{Message, PayloadItem, PayloadSize, ResponseHead, SendError};

/// Buffered bytes above which [`IoWritable`] reports backpressure.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

type Item = Message<(ResponseHead, PayloadSize), Bytes>;

/// A connection writing its response to `io`.
pub fn connection<W>(head: RequestHead, io: W) -> (Connection<IoWritable<W>>, ConnectionHandle)
where
    W: AsyncWrite + Unpin,
{
    connection_with_high_water_mark(head, io, DEFAULT_HIGH_WATER_MARK)
}

pub fn connection_with_high_water_mark<W>(head: RequestHead, io: W, high_water_mark: usize) -> (Connection<IoWritable<W>>, ConnectionHandle)
where
    W: AsyncWrite + Unpin,
{
    Connection::with_writable(head, |lifecycle| {
        let mut writable = IoWritable::with_high_water_mark(io, high_water_mark);
        writable.lifecycle = Some(lifecycle.clone());
        writable
    })
}

/// A [`Writable`] framing responses onto an `AsyncWrite`.
#[derive(Debug)]
pub struct IoWritable<W> {
    io: W,
    encoder: ResponseEncoder,
    buffer: BytesMut,
    high_water_mark: usize,
    destroyed: bool,
    lifecycle: Option<Lifecycle>,
}

impl<W: AsyncWrite + Unpin> IoWritable<W> {
    /// A writable not tied to a connection; write failures are only returned.
    pub fn new(io: W) -> Self {
        Self::with_high_water_mark(io, DEFAULT_HIGH_WATER_MARK)
    }

    pub fn with_high_water_mark(io: W, high_water_mark: usize) -> Self {
        Self {
            io,
            encoder: ResponseEncoder::new(),
            buffer: BytesMut::new(),
            high_water_mark: high_water_mark.max(1),
            destroyed: false,
            lifecycle: None,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.io
    }

    pub fn into_inner(self) -> W {
        self.io
    }

    fn encode(&mut self, item: Item) -> io::Result<()> {
        if self.destroyed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.encoder.encode(item, &mut self.buffer).map_err(into_io_error)
    }

    /// Writes buffered bytes until no more than `keep` remain.
    fn poll_write_buffer(&mut self, cx: &mut Context<'_>, keep: usize) -> Poll<io::Result<()>> {
        if self.destroyed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        while self.buffer.len() > keep {
            let written = ready!(Pin::new(&mut self.io).poll_write(cx, &self.buffer)).map_err(|e| self.report(e))?;
            if written == 0 {
                return Poll::Ready(Err(self.report(io::Error::from(io::ErrorKind::WriteZero))));
            }
            trace!(written, buffered = self.buffer.len() - written, "write response bytes");
            self.buffer.advance(written);
        }
        Poll::Ready(Ok(()))
    }

    fn poll_flush_io(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_write_buffer(cx, 0))?;
        Pin::new(&mut self.io).poll_flush(cx).map_err(|e| self.report(e))
    }

    /// A transport failure fails the connection as well.
    fn report(&self, e: io::Error) -> io::Error {
        if let Some(lifecycle) = &self.lifecycle {
            debug!(cause = %e, "write to connection failed");
            lifecycle.fail(io::Error::new(e.kind(), e.to_string()));
        }
        e
    }
}

impl<W: AsyncWrite + Unpin> Writable for IoWritable<W> {
    fn write_head(&mut self, head: ResponseHead, payload_size: PayloadSize) -> io::Result<()> {
        self.encode(Message::Header((head, payload_size)))
    }

    fn write(&mut self, chunk: Bytes) -> io::Result<WriteState> {
        self.encode(Message::Payload(PayloadItem::Chunk(chunk)))?;
        if self.buffer.len() >= self.high_water_mark { Ok(WriteState::Backpressure) } else { Ok(WriteState::Ready) }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let keep = self.high_water_mark - 1;
        self.poll_write_buffer(cx, keep)
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush_io(cx)
    }

    fn poll_end(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.encoder.in_payload() {
            self.encode(Message::Payload(PayloadItem::Eof))?;
        }
        self.poll_flush_io(cx)
    }

    fn destroy(&mut self) {
        self.destroyed = true;
        self.buffer.clear();
    }
}

fn into_io_error(e: SendError) -> io::Error {
    match e {
        SendError::Io { source } => source,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

enum Fed {
    /// The reader ended
    Drained,
    /// The body consumer is gone, the rest of the body is not wanted
    Detached,
    /// The read failed and was reported
    Failed,
}

impl ConnectionHandle {
    /// Pushes everything `reader` yields as the request body, then ends it.
    ///
    /// Nothing is read before the body is first pulled. A read error is pushed as a body error,
    /// which also fails the connection.
    pub async fn feed_from<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        if let Fed::Drained = self.pump(reader).await {
            self.push_end();
        }
    }

    /// Reads a request body of `body_length` bytes from `reader`, then watches the rest of the
    /// stream until it ends.
    ///
    /// The end of the stream closes the connection and a read error fails it, so a peer that goes
    /// away while the response is still being written aborts the request. A stream ending inside
    /// the body is a body error. Bytes following the body are discarded.
    pub async fn read_from<R>(&self, mut reader: R, body_length: u64)
    where
        R: AsyncRead + Unpin,
    {
        if body_length == 0 {
            self.push_end();
        } else {
            let mut body = (&mut reader).take(body_length);
            match self.pump(&mut body).await {
                Fed::Drained if body.limit() > 0 => {
                    debug!(missing = body.limit(), "connection ended inside request body");
                    self.push_error(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before the request body ended"));
                    return;
                }
                Fed::Drained => self.push_end(),
                Fed::Detached => {}
                Fed::Failed => return,
            }
        }
        self.watch_close(reader).await;
    }

    /// Reads `reader` to its end, then closes the connection. A read error fails it instead.
    pub async fn watch_close<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, BytesCodec::new());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(bytes) => trace!(size = bytes.len(), "discard bytes after request body"),
                Err(e) => {
                    debug!(cause = %e, "connection read failed");
                    self.fail(e);
                    return;
                }
            }
        }
        debug!("peer closed connection");
        self.close();
    }

    async fn pump<R>(&self, reader: R) -> Fed
    where
        R: AsyncRead + Unpin,
    {
        self.flowing().await;

        let mut frames = FramedRead::new(reader, BytesCodec::new());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(bytes) => {
                    if self.inbound().is_closed() {
                        trace!("stop feeding request body, consumer is gone");
                        return Fed::Detached;
                    }
                    self.push_data(bytes.freeze());
                }
                Err(e) => {
                    error!(cause = %e, "can't read request body");
                    self.push_error(e);
                    return Fed::Failed;
                }
            }
        }
        Fed::Drained
    }
}
