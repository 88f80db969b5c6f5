//! An in-memory connection.
//!
//! [`pair`] returns a [`Connection`] whose writable half records everything written to it and a
//! [`MemoryPeer`] that plays the host and the client at once: it pushes request body events,
//! reads response output (which is what relieves backpressure), and can close the connection
//! at any point.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use http::{HeaderValue, StatusCode};
use tokio::sync::Notify;

use crate::connection::{Connection, ConnectionHandle, RequestHead, Writable, WriteState};
use crate::protocol::{HeaderCaseMap, PayloadSize, ResponseHead};

/// Unread output above which the writable reports backpressure.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

pub fn pair(head: RequestHead) -> (Connection<MemoryWritable>, MemoryPeer) {
    pair_with_high_water_mark(head, DEFAULT_HIGH_WATER_MARK)
}

pub fn pair_with_high_water_mark(head: RequestHead, high_water_mark: usize) -> (Connection<MemoryWritable>, MemoryPeer) {
    let shared = Arc::new(Shared { state: Mutex::new(MemoryState::new(high_water_mark)), activity: Notify::new() });
    let (connection, handle) = Connection::new(head, MemoryWritable { shared: Arc::clone(&shared) });
    (connection, MemoryPeer { handle, shared })
}

struct Shared {
    state: Mutex<MemoryState>,
    activity: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MemoryState {
    status: Option<StatusCode>,
    headers: Vec<(Bytes, HeaderValue)>,
    payload_size: Option<PayloadSize>,
    output: BytesMut,
    bytes_written: u64,
    write_count: usize,
    flush_count: usize,
    high_water_mark: usize,
    backpressured: bool,
    writes_while_backpressured: usize,
    ended: bool,
    destroyed: bool,
    closed: bool,
    drain_waker: Option<Waker>,
}

impl MemoryState {
    fn new(high_water_mark: usize) -> Self {
        Self {
            status: None,
            headers: Vec::new(),
            payload_size: None,
            output: BytesMut::new(),
            bytes_written: 0,
            write_count: 0,
            flush_count: 0,
            high_water_mark: high_water_mark.max(1),
            backpressured: false,
            writes_while_backpressured: 0,
            ended: false,
            destroyed: false,
            closed: false,
            drain_waker: None,
        }
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.closed || self.destroyed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if self.ended {
            return Err(io::Error::other("write after end"));
        }
        Ok(())
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.drain_waker.take() {
            waker.wake();
        }
    }

    fn is_done(&self) -> bool {
        self.ended || self.destroyed || self.closed
    }
}

/// The recording writable half of an in-memory connection.
pub struct MemoryWritable {
    shared: Arc<Shared>,
}

impl MemoryWritable {
    fn update<T>(&mut self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let result = f(&mut self.shared.lock());
        self.shared.activity.notify_waiters();
        result
    }
}

impl Writable for MemoryWritable {
    fn write_head(&mut self, head: ResponseHead, payload_size: PayloadSize) -> io::Result<()> {
        self.update(|state| {
            state.check_writable()?;
            if state.status.is_some() {
                return Err(io::Error::other("response head written twice"));
            }

            let (parts, ()) = head.into_parts();
            let cases = parts.extensions.get::<HeaderCaseMap>().cloned().unwrap_or_default();
            state.headers = cases.cased(&parts.headers).map(|(name, value)| (Bytes::copy_from_slice(name), value.clone())).collect();
            state.status = Some(parts.status);
            state.payload_size = Some(payload_size);
            Ok(())
        })
    }

    fn write(&mut self, chunk: Bytes) -> io::Result<WriteState> {
        self.update(|state| {
            state.check_writable()?;
            if state.backpressured {
                state.writes_while_backpressured += 1;
            }

            state.output.extend_from_slice(&chunk);
            state.bytes_written += chunk.len() as u64;
            state.write_count += 1;

            if state.output.len() >= state.high_water_mark {
                state.backpressured = true;
                Ok(WriteState::Backpressure)
            } else {
                Ok(WriteState::Ready)
            }
        })
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        if state.closed || state.destroyed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }

        if state.output.len() < state.high_water_mark {
            state.backpressured = false;
            return Poll::Ready(Ok(()));
        }

        state.drain_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.update(|state| {
            state.check_writable()?;
            state.flush_count += 1;
            Ok(())
        }))
    }

    fn poll_end(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.update(|state| {
            state.check_writable()?;
            state.ended = true;
            Ok(())
        }))
    }

    fn destroy(&mut self) {
        self.update(|state| {
            state.destroyed = true;
            state.wake_writer();
        });
    }
}

impl std::fmt::Debug for MemoryWritable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWritable").finish_non_exhaustive()
    }
}

/// The other end of an in-memory connection.
pub struct MemoryPeer {
    handle: ConnectionHandle,
    shared: Arc<Shared>,
}

impl MemoryPeer {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn push_data(&self, chunk: impl Into<Bytes>) {
        self.handle.push_data(chunk);
    }

    pub fn push_end(&self) {
        self.handle.push_end();
    }

    pub fn push_error(&self, error: io::Error) {
        self.handle.push_error(error);
        self.mark_closed();
    }

    /// Sends a whole request body at once and ends it.
    pub fn send(&self, body: impl Into<Bytes>) {
        self.handle.push_data(body);
        self.handle.push_end();
    }

    pub async fn flowing(&self) {
        self.handle.flowing().await;
    }

    /// The client goes away: the connection closes and further writes fail.
    pub fn close(&self) {
        self.handle.close();
        self.mark_closed();
    }

    pub fn fail(&self, error: io::Error) {
        self.handle.fail(error);
        self.mark_closed();
    }

    fn mark_closed(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        state.wake_writer();
        drop(state);
        self.shared.activity.notify_waiters();
    }

    /// Takes the output written so far, making room for the writer.
    pub fn read(&self) -> Bytes {
        let mut state = self.shared.lock();
        let bytes = state.output.split().freeze();
        state.wake_writer();
        bytes
    }

    /// Waits until something happens on the writable side.
    pub async fn changed(&self) {
        self.shared.activity.notified().await;
    }

    /// Reads output until the response ended, was destroyed, or the connection closed.
    pub async fn finished(&self) -> Bytes {
        let mut collected = BytesMut::new();
        loop {
            let notified = self.shared.activity.notified();
            let done = self.shared.lock().is_done();
            collected.extend_from_slice(&self.read());
            if done {
                return collected.freeze();
            }
            notified.await;
        }
    }

    pub fn set_high_water_mark(&self, high_water_mark: usize) {
        let mut state = self.shared.lock();
        state.high_water_mark = high_water_mark.max(1);
        state.wake_writer();
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.shared.lock().status
    }

    /// Response headers as written, with their wire spelling.
    pub fn headers(&self) -> Vec<(String, String)> {
        self.shared
            .lock()
            .headers
            .iter()
            .map(|(name, value)| (String::from_utf8_lossy(name).into_owned(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect()
    }

    pub fn payload_size(&self) -> Option<PayloadSize> {
        self.shared.lock().payload_size
    }

    pub fn is_ended(&self) -> bool {
        self.shared.lock().ended
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    pub fn bytes_written(&self) -> u64 {
        self.shared.lock().bytes_written
    }

    pub fn write_count(&self) -> usize {
        self.shared.lock().write_count
    }

    /// How often the writer flushed while waiting on its body.
    pub fn flush_count(&self) -> usize {
        self.shared.lock().flush_count
    }

    /// Writes issued while the writable was reporting backpressure. Should stay zero.
    pub fn writes_while_backpressured(&self) -> usize {
        self.shared.lock().writes_while_backpressured
    }
}

impl std::fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeer").field("handle", &self.handle).finish_non_exhaustive()
    }
}
