use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::FutureExt;
use http_body::{Body, Frame, SizeHint};
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::cancel::{AbortReason, AbortSignal};
use crate::protocol::body::ChunkSource;
use crate::protocol::{BodyError, PayloadItem, PayloadSize};

/// The request body as a lazy, single-pass `http_body::Body`.
///
/// Each poll first checks the request's [`AbortSignal`]: once the connection is gone the body
/// yields [`BodyError::Aborted`] instead of waiting for chunks that will never come.
pub struct ReqBody {
    source: ChunkSource,
    signal: AbortSignal,
    aborted: Pin<Box<WaitForCancellationFutureOwned>>,
    payload_size: PayloadSize,
    limit: Option<u64>,
    received: u64,
    finished: bool,
}

impl ReqBody {
    pub(crate) fn new(source: ChunkSource, signal: AbortSignal, payload_size: PayloadSize, limit: Option<u64>) -> Self {
        let aborted = Box::pin(signal.owned_token().cancelled_owned());
        Self { source, signal, aborted, payload_size, limit, received: 0, finished: false }
    }

    /// Bytes pulled so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    fn fail(&mut self, error: BodyError) -> Poll<Option<Result<Frame<Bytes>, BodyError>>> {
        self.finished = true;
        Poll::Ready(Some(Err(error)))
    }

    fn abort_reason(&self) -> AbortReason {
        self.signal.reason().unwrap_or(AbortReason::ClientClosed)
    }
}

impl Body for ReqBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }

        if this.signal.is_aborted() {
            let reason = this.abort_reason();
            return this.fail(BodyError::Aborted(reason));
        }

        match this.source.poll_next_chunk(cx) {
            Poll::Ready(Ok(PayloadItem::Chunk(bytes))) => {
                this.received += bytes.len() as u64;
                match this.limit {
                    Some(limit) if this.received > limit => this.fail(BodyError::TooLarge { limit }),
                    _ => Poll::Ready(Some(Ok(Frame::data(bytes)))),
                }
            }
            Poll::Ready(Ok(PayloadItem::Eof)) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Err(e)) => this.fail(e),
            Poll::Pending => match this.aborted.poll_unpin(cx) {
                Poll::Ready(()) => {
                    let reason = this.abort_reason();
                    this.fail(BodyError::Aborted(reason))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        self.payload_size.into()
    }
}

impl std::fmt::Debug for ReqBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqBody")
            .field("payload_size", &self.payload_size)
            .field("received", &self.received)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationBridge;
    use crate::connection::Lifecycle;
    use crate::protocol::body::chunk_channel;
    use http_body_util::BodyExt;

    fn body(limit: Option<u64>) -> (crate::protocol::body::InboundSender, ReqBody, Lifecycle) {
        let lifecycle = Lifecycle::new();
        let bridge = CancellationBridge::attach(&lifecycle);
        let (sender, source) = chunk_channel();
        (sender, ReqBody::new(source, bridge.signal(), PayloadSize::Chunked, limit), lifecycle)
    }

    #[tokio::test]
    async fn collects_any_chunking_byte_for_byte() {
        let payload: Vec<u8> = (0..=255u8).chain([0, 0, 0xff, 0xfe, 0xc3, 0x28]).collect();

        for split in [1, 2, 7, 64, payload.len()] {
            let (sender, body, _lifecycle) = body(None);
            for chunk in payload.chunks(split) {
                sender.push_data(Bytes::copy_from_slice(chunk));
            }
            sender.push_end();

            let collected = body.collect().await.unwrap().to_bytes();
            assert_eq!(collected.as_ref(), payload.as_slice(), "chunk size {split}");
        }
    }

    #[tokio::test]
    async fn pending_read_resolves_on_abort() {
        let (_sender, body, lifecycle) = body(None);

        let reader = tokio::spawn(body.collect());
        tokio::task::yield_now().await;
        lifecycle.close();

        match reader.await.unwrap() {
            Err(BodyError::Aborted(AbortReason::ClientClosed)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn limit_is_enforced() {
        let (sender, body, _lifecycle) = body(Some(4));
        sender.push_data(Bytes::from_static(b"abc"));
        sender.push_data(Bytes::from_static(b"de"));
        sender.push_end();

        match body.collect().await {
            Err(BodyError::TooLarge { limit: 4 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finished_after_eof() {
        let (sender, mut body, _lifecycle) = body(None);
        sender.push_end();

        assert!(body.frame().await.is_none());
        assert!(body.is_end_stream());
        assert!(body.frame().await.is_none());
    }
}
