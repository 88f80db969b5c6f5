use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tokio::sync::watch;
use tracing::trace;

use crate::protocol::{BodyError, PayloadItem};

/// Creates the two ends of an inbound body queue.
///
/// The host pushes events through the [`InboundSender`]; the request body pulls them from the
/// [`ChunkSource`].
pub fn chunk_channel() -> (InboundSender, ChunkSource) {
    let (flowing, _) = watch::channel(false);
    let shared = Arc::new(Shared { state: Mutex::new(SourceState::Idle), flowing });
    (InboundSender { shared: Arc::clone(&shared) }, ChunkSource { shared })
}

/// State of the queue between a pushing host and a pulling consumer.
enum SourceState {
    /// Open, nothing queued, nobody waiting
    Idle,
    /// Open with chunks the consumer has not pulled yet
    Buffering(VecDeque<Bytes>),
    /// Open, empty, and the consumer is parked on this waker
    AwaitingConsumer(Waker),
    /// End seen; the remaining chunks are still delivered first
    Ended(VecDeque<Bytes>),
    /// Error seen; the remaining chunks are delivered, then the error once
    Errored(VecDeque<Bytes>, Option<io::Error>),
    /// The consumer is gone, everything pushed from now on is dropped
    Detached,
}

impl SourceState {
    fn is_open(&self) -> bool {
        matches!(self, SourceState::Idle | SourceState::Buffering(_) | SourceState::AwaitingConsumer(_))
    }

    /// Takes whatever is queued while the stream is still open, waking a parked consumer.
    fn take_open_queue(&mut self) -> VecDeque<Bytes> {
        match std::mem::replace(self, SourceState::Idle) {
            SourceState::Buffering(queue) => queue,
            SourceState::AwaitingConsumer(waker) => {
                waker.wake();
                VecDeque::new()
            }
            _ => VecDeque::new(),
        }
    }
}

struct Shared {
    state: Mutex<SourceState>,
    flowing: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminate(&self, make_state: impl FnOnce(VecDeque<Bytes>) -> SourceState) -> bool {
        let mut state = self.lock();
        if !state.is_open() {
            return false;
        }

        let queue = state.take_open_queue();
        *state = make_state(queue);
        true
    }
}

/// Producer side of the inbound body, owned by the host.
///
/// Pushing never blocks and never fails: events arriving after the stream ended or after the
/// consumer went away are dropped.
pub struct InboundSender {
    shared: Arc<Shared>,
}

impl InboundSender {
    pub fn push_data(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        let mut state = self.shared.lock();
        match &mut *state {
            SourceState::Idle => *state = SourceState::Buffering(VecDeque::from([chunk])),
            SourceState::Buffering(queue) => queue.push_back(chunk),
            SourceState::AwaitingConsumer(_) => {
                let queue = state.take_open_queue();
                debug_assert!(queue.is_empty());
                *state = SourceState::Buffering(VecDeque::from([chunk]));
            }
            SourceState::Ended(_) | SourceState::Errored(..) | SourceState::Detached => {
                trace!(size = chunk.len(), "drop inbound chunk, body no longer accepts data");
            }
        }
    }

    pub fn push_end(&self) {
        if !self.shared.terminate(SourceState::Ended) {
            trace!("ignore end event, body already finished");
        }
    }

    pub fn push_error(&self, error: io::Error) {
        let mut error = Some(error);
        if !self.shared.terminate(|queue| SourceState::Errored(queue, error.take())) {
            trace!(cause = ?error, "ignore error event, body already finished");
        }
    }

    /// True once the consumer pulled for the first time.
    pub fn is_flowing(&self) -> bool {
        *self.shared.flowing.borrow()
    }

    /// Resolves once the consumer starts pulling, the point where a paused transport resumes.
    pub async fn flowing(&self) {
        let mut receiver = self.shared.flowing.subscribe();
        // the sender lives in `shared`, which we hold, so the channel can't close
        let _ = receiver.wait_for(|flowing| *flowing).await;
    }

    /// True when pushes are no longer accepted.
    pub fn is_closed(&self) -> bool {
        !self.shared.lock().is_open()
    }
}

impl Drop for InboundSender {
    fn drop(&mut self) {
        let error = io::Error::new(io::ErrorKind::UnexpectedEof, "connection dropped before the body ended");
        let mut error = Some(error);
        self.shared.terminate(|queue| SourceState::Errored(queue, error.take()));
    }
}

impl std::fmt::Debug for InboundSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundSender").field("flowing", &self.is_flowing()).finish()
    }
}

/// Consumer side of the inbound body: a pull-based sequence of chunks.
pub struct ChunkSource {
    shared: Arc<Shared>,
}

impl ChunkSource {
    /// Pulls the next chunk, [`PayloadItem::Eof`] at the end, or the error the host pushed.
    pub fn poll_next_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Result<PayloadItem, BodyError>> {
        self.shared.flowing.send_if_modified(|flowing| !std::mem::replace(flowing, true));

        let mut state = self.shared.lock();
        match &mut *state {
            SourceState::Idle | SourceState::AwaitingConsumer(_) => {
                *state = SourceState::AwaitingConsumer(cx.waker().clone());
                Poll::Pending
            }
            SourceState::Buffering(queue) => {
                let chunk = queue.pop_front();
                if queue.is_empty() {
                    *state = SourceState::Idle;
                }
                match chunk {
                    Some(chunk) => Poll::Ready(Ok(PayloadItem::Chunk(chunk))),
                    None => {
                        *state = SourceState::AwaitingConsumer(cx.waker().clone());
                        Poll::Pending
                    }
                }
            }
            SourceState::Ended(queue) => Poll::Ready(Ok(queue.pop_front().map_or(PayloadItem::Eof, PayloadItem::Chunk))),
            SourceState::Errored(queue, error) => match queue.pop_front() {
                Some(chunk) => Poll::Ready(Ok(PayloadItem::Chunk(chunk))),
                None => {
                    let error = error.take().unwrap_or_else(|| io::Error::other("inbound stream already failed"));
                    Poll::Ready(Err(BodyError::transport(error)))
                }
            },
            SourceState::Detached => Poll::Ready(Ok(PayloadItem::Eof)),
        }
    }

    pub async fn next_chunk(&mut self) -> Result<PayloadItem, BodyError> {
        poll_fn(|cx| self.poll_next_chunk(cx)).await
    }
}

impl Drop for ChunkSource {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            if let SourceState::Buffering(queue) | SourceState::Ended(queue) | SourceState::Errored(queue, _) = &*state {
                if !queue.is_empty() {
                    trace!(chunks = queue.len(), "discard unread inbound chunks");
                }
            }
            *state = SourceState::Detached;
        }
        // a host waiting to resume may go on, its pushes are dropped from now on
        self.shared.flowing.send_if_modified(|flowing| !std::mem::replace(flowing, true));
    }
}

impl std::fmt::Debug for ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSource").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    fn chunk(item: PayloadItem) -> Bytes {
        item.into_bytes().expect("expected chunk")
    }

    #[tokio::test]
    async fn buffers_chunks_before_first_pull() {
        let (sender, mut source) = chunk_channel();

        sender.push_data(Bytes::from_static(b"hello "));
        sender.push_data(Bytes::from_static(b"world"));
        sender.push_end();
        sender.push_data(Bytes::from_static(b"ignored"));

        assert_eq!(chunk(source.next_chunk().await.unwrap()), Bytes::from_static(b"hello "));
        assert_eq!(chunk(source.next_chunk().await.unwrap()), Bytes::from_static(b"world"));
        assert!(source.next_chunk().await.unwrap().is_eof());
        assert!(source.next_chunk().await.unwrap().is_eof());
    }

    #[test]
    fn parks_consumer_until_data_arrives() {
        let (sender, mut source) = chunk_channel();
        let mut cx = Context::from_waker(noop_waker_ref());

        assert!(!sender.is_flowing());
        assert!(source.poll_next_chunk(&mut cx).is_pending());
        assert!(sender.is_flowing());

        sender.push_data(Bytes::from_static(b"x"));
        match source.poll_next_chunk(&mut cx) {
            Poll::Ready(Ok(PayloadItem::Chunk(bytes))) => assert_eq!(bytes, Bytes::from_static(b"x")),
            other => panic!("unexpected poll result: {other:?}"),
        }
        assert!(source.poll_next_chunk(&mut cx).is_pending());
    }

    #[tokio::test]
    async fn wakes_pending_pull() {
        let (sender, mut source) = chunk_channel();

        let reader = tokio::spawn(async move { source.next_chunk().await });
        sender.flowing().await;
        sender.push_data(Bytes::from_static(b"late"));

        let item = reader.await.unwrap().unwrap();
        assert_eq!(item.as_bytes(), Some(&Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn error_follows_buffered_chunks() {
        let (sender, mut source) = chunk_channel();

        sender.push_data(Bytes::from_static(b"partial"));
        sender.push_error(io::Error::from(io::ErrorKind::ConnectionReset));
        sender.push_end();

        assert!(source.next_chunk().await.unwrap().is_chunk());
        match source.next_chunk().await {
            Err(BodyError::Transport { source }) => assert_eq!(source.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_sender_is_unexpected_eof() {
        let (sender, mut source) = chunk_channel();
        sender.push_data(Bytes::from_static(b"abc"));
        drop(sender);

        assert!(source.next_chunk().await.unwrap().is_chunk());
        match source.next_chunk().await {
            Err(BodyError::Transport { source }) => assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn pushes_after_consumer_dropped_are_discarded() {
        let (sender, source) = chunk_channel();
        sender.push_data(Bytes::from_static(b"queued"));
        drop(source);

        assert!(sender.is_closed());
        sender.push_data(Bytes::from_static(b"dropped"));
        sender.push_end();
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn dropped_consumer_releases_waiting_host() {
        let (sender, source) = chunk_channel();
        assert!(!sender.is_flowing());

        drop(source);
        sender.flowing().await;
        assert!(sender.is_flowing());
    }

    #[tokio::test]
    async fn empty_body_ends_immediately() {
        let (sender, mut source) = chunk_channel();
        sender.push_data(Bytes::new());
        sender.push_end();

        assert!(source.next_chunk().await.unwrap().is_eof());
    }
}
