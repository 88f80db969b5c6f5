use std::future::poll_fn;
use std::io;
use std::task::{Context, Poll};

use bytes::Bytes;

use crate::protocol::{PayloadSize, ResponseHead};

/// What a writable reports after accepting a chunk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteState {
    /// More chunks may be written right away
    Ready,
    /// The chunk was accepted, but nothing more should be written until drained
    Backpressure,
}

/// The outbound half of a connection.
///
/// Framing is the implementor's business: the bridge hands over the head once, then body chunks
/// in order, then ends. A chunk passed to [`write`](Writable::write) is always accepted;
/// [`WriteState::Backpressure`] only asks the caller to wait on [`poll_drain`](Writable::poll_drain)
/// before the next one.
pub trait Writable {
    fn write_head(&mut self, head: ResponseHead, payload_size: PayloadSize) -> io::Result<()>;

    fn write(&mut self, chunk: Bytes) -> io::Result<WriteState>;

    /// Ready once the writable can take more data.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Pushes everything written so far to the peer. Called while the body has nothing ready.
    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Finishes the response; ready once everything written has been flushed.
    fn poll_end(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Tears the response down after a failure; nothing more will be written.
    fn destroy(&mut self);
}

pub(crate) async fn drain<W: Writable + ?Sized>(writable: &mut W) -> io::Result<()> {
    poll_fn(|cx| writable.poll_drain(cx)).await
}

pub(crate) async fn flush<W: Writable + ?Sized>(writable: &mut W) -> io::Result<()> {
    poll_fn(|cx| writable.poll_flush(cx)).await
}

pub(crate) async fn end<W: Writable + ?Sized>(writable: &mut W) -> io::Result<()> {
    poll_fn(|cx| writable.poll_end(cx)).await
}
