//! The host-facing side of the bridge.
//!
//! A host that already accepted a connection and parsed its request line describes it with a
//! [`RequestHead`], wraps its output in a [`Writable`] and calls [`Connection::new`]. It keeps the
//! returned [`ConnectionHandle`] to push inbound body events and to report that the connection
//! closed or failed; the [`Connection`] itself goes to the
//! [`Dispatcher`](crate::dispatcher::Dispatcher).
//!
//! # Components
//!
//! - [`Writable`]: the outbound half, accepting head and body writes and signalling backpressure
//! - [`Lifecycle`]: close and error notifications, fired at most once
//! - [`memory`]: an in-memory connection for tests and embedders
//! - [`io`]: glue for tokio `AsyncRead`/`AsyncWrite` transports, including disconnect detection

pub mod io;
pub mod memory;

mod head;
mod lifecycle;
mod writable;

pub use head::RequestHead;
pub use lifecycle::{Lifecycle, LifecycleEvent};
pub use writable::{Writable, WriteState};

pub(crate) use writable::{drain, end, flush};

use std::io as std_io;

use bytes::Bytes;

use crate::protocol::body::{ChunkSource, InboundSender, chunk_channel};

/// One accepted connection carrying one request, as handed to the dispatcher.
#[derive(Debug)]
pub struct Connection<W> {
    head: RequestHead,
    source: ChunkSource,
    lifecycle: Lifecycle,
    writable: W,
}

impl<W> Connection<W> {
    pub fn new(head: RequestHead, writable: W) -> (Self, ConnectionHandle) {
        Self::with_writable(head, |_| writable)
    }

    /// Builds the writable with access to the connection's lifecycle, so it can report failures.
    pub(crate) fn with_writable(head: RequestHead, make_writable: impl FnOnce(&Lifecycle) -> W) -> (Self, ConnectionHandle) {
        let (inbound, source) = chunk_channel();
        let lifecycle = Lifecycle::new();
        let writable = make_writable(&lifecycle);
        let handle = ConnectionHandle { inbound, lifecycle: lifecycle.clone() };
        (Self { head, source, lifecycle, writable }, handle)
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn into_parts(self) -> (RequestHead, ChunkSource, Lifecycle, W) {
        (self.head, self.source, self.lifecycle, self.writable)
    }
}

/// The host's grip on a [`Connection`]: inbound events plus lifecycle notifications.
///
/// Dropping the handle before the connection was closed counts as the connection going away.
#[derive(Debug)]
pub struct ConnectionHandle {
    inbound: InboundSender,
    lifecycle: Lifecycle,
}

impl ConnectionHandle {
    pub fn push_data(&self, chunk: impl Into<Bytes>) {
        self.inbound.push_data(chunk.into());
    }

    pub fn push_end(&self) {
        self.inbound.push_end();
    }

    /// Reports a failure of the readable half. This also fails the connection.
    pub fn push_error(&self, error: std_io::Error) {
        let message = error.to_string();
        let kind = error.kind();
        self.inbound.push_error(error);
        self.lifecycle.fail(std_io::Error::new(kind, message));
    }

    /// Resolves once the request body is being read; a paused transport resumes here.
    pub async fn flowing(&self) {
        self.inbound.flowing().await;
    }

    pub fn is_flowing(&self) -> bool {
        self.inbound.is_flowing()
    }

    /// The peer closed the connection.
    pub fn close(&self) {
        self.lifecycle.close();
    }

    /// The connection failed below the bridge.
    pub fn fail(&self, error: std_io::Error) {
        self.lifecycle.fail(error);
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub(crate) fn inbound(&self) -> &InboundSender {
        &self.inbound
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.lifecycle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationBridge;
    use http::Method;

    #[test]
    fn dropping_handle_closes_connection() {
        let head = RequestHead::new(Method::GET, "/".parse().unwrap());
        let (connection, handle) = Connection::new(head, ());
        let bridge = CancellationBridge::attach(connection.lifecycle());

        drop(handle);
        assert!(bridge.signal().is_aborted());
    }

    #[test]
    fn push_error_fails_connection() {
        let head = RequestHead::new(Method::POST, "/upload".parse().unwrap());
        let (connection, handle) = Connection::new(head, ());
        let bridge = CancellationBridge::attach(connection.lifecycle());

        handle.push_error(std_io::Error::from(std_io::ErrorKind::InvalidData));
        assert!(matches!(bridge.signal().reason(), Some(crate::cancel::AbortReason::Transport(_))));
    }
}
