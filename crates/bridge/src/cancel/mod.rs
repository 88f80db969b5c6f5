//! Connection-driven cancellation.
//!
//! A [`CancellationBridge`] watches the [`Lifecycle`] of one connection. The first close or
//! error seen before the response is complete flips the request's [`AbortSignal`] to aborted,
//! which is final. The signal is shared by the request body reader, the response writer and any
//! application code holding a clone, so every party learns about a vanished client the same way.

mod latch;

pub(crate) use latch::Latch;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

use crate::connection::{Lifecycle, LifecycleEvent};

/// Why a request was aborted.
#[derive(Debug, Clone, Error)]
pub enum AbortReason {
    #[error("client closed the connection")]
    ClientClosed,

    #[error("connection failed: {0}")]
    Transport(Arc<io::Error>),
}

impl From<&LifecycleEvent> for AbortReason {
    fn from(event: &LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Closed => AbortReason::ClientClosed,
            LifecycleEvent::Failed(e) => AbortReason::Transport(Arc::clone(e)),
        }
    }
}

/// The read side of a request's cancellation flag.
///
/// Cheap to clone; all clones observe the same flag. Only the owning [`CancellationBridge`]
/// can abort it.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    reason: Latch<AbortReason>,
    token: CancellationToken,
}

impl AbortSignal {
    fn new() -> Self {
        Self { inner: Arc::new(SignalInner { reason: Latch::new(), token: CancellationToken::new() }) }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.reason.is_set()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.get()
    }

    /// Runs `callback` once the signal is aborted, or right away if it already is.
    ///
    /// Callbacks run in registration order, one after another, on the thread that aborts.
    pub fn on_abort<F>(&self, callback: F)
    where
        F: FnOnce(&AbortReason) + Send + 'static,
    {
        self.inner.reason.subscribe(callback);
    }

    /// Resolves once the signal is aborted.
    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// A token that is cancelled together with this signal.
    ///
    /// It is a child token, cancelling it does not abort the request.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    pub(crate) fn owned_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    fn abort(&self, reason: AbortReason) -> bool {
        let Some(listeners) = self.inner.reason.set(reason) else {
            return false;
        };

        self.inner.token.cancel();
        listeners.notify();
        true
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal").field("reason", &self.reason()).finish()
    }
}

/// Turns connection teardown into an aborted [`AbortSignal`].
#[derive(Debug, Clone)]
pub struct CancellationBridge {
    inner: Arc<BridgeInner>,
}

#[derive(Debug)]
struct BridgeInner {
    signal: AbortSignal,
    completed: AtomicBool,
}

impl BridgeInner {
    fn on_lifecycle(&self, event: &LifecycleEvent) {
        if self.completed.load(Ordering::Acquire) {
            debug!(?event, "connection ended after response completed");
            return;
        }

        let reason = AbortReason::from(event);
        info!(%reason, "connection ended before response completed, aborting request");
        self.signal.abort(reason);
    }
}

impl CancellationBridge {
    /// Creates a bridge listening to `lifecycle`.
    ///
    /// If the connection already closed, the signal is aborted before this returns.
    pub fn attach(lifecycle: &Lifecycle) -> Self {
        let inner = Arc::new(BridgeInner { signal: AbortSignal::new(), completed: AtomicBool::new(false) });

        let listener = Arc::clone(&inner);
        lifecycle.subscribe(move |event| listener.on_lifecycle(event));

        Self { inner }
    }

    pub fn signal(&self) -> AbortSignal {
        self.inner.signal.clone()
    }

    pub fn on_abort<F>(&self, callback: F)
    where
        F: FnOnce(&AbortReason) + Send + 'static,
    {
        self.inner.signal.on_abort(callback);
    }

    /// Aborts the request directly. Returns false if it was already aborted.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.inner.signal.abort(reason)
    }

    /// Marks the response as fully written; a later close is a normal shutdown.
    pub fn complete(&self) {
        self.inner.completed.store(true, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_aborts_and_notifies_in_order() {
        let lifecycle = Lifecycle::new();
        let bridge = CancellationBridge::attach(&lifecycle);
        let signal = bridge.signal();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            signal.on_abort(move |_| order.lock().unwrap().push(i));
        }

        assert!(!signal.is_aborted());
        lifecycle.close();
        lifecycle.close();

        assert!(signal.is_aborted());
        assert!(matches!(signal.reason(), Some(AbortReason::ClientClosed)));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn late_observer_sees_abort_immediately() {
        let lifecycle = Lifecycle::new();
        let bridge = CancellationBridge::attach(&lifecycle);
        lifecycle.close();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bridge.signal().on_abort(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(bridge.signal().aborted().now_or_never().is_some());
        assert!(bridge.signal().token().is_cancelled());
    }

    #[test]
    fn attach_after_close_is_aborted() {
        let lifecycle = Lifecycle::new();
        lifecycle.fail(io::Error::from(io::ErrorKind::ConnectionReset));

        let bridge = CancellationBridge::attach(&lifecycle);
        assert!(matches!(bridge.signal().reason(), Some(AbortReason::Transport(_))));
    }

    #[test]
    fn close_after_completion_is_not_an_abort() {
        let lifecycle = Lifecycle::new();
        let bridge = CancellationBridge::attach(&lifecycle);

        bridge.complete();
        lifecycle.close();

        assert!(!bridge.signal().is_aborted());
    }

    #[test]
    fn child_token_does_not_abort() {
        let lifecycle = Lifecycle::new();
        let bridge = CancellationBridge::attach(&lifecycle);

        bridge.signal().token().cancel();
        assert!(!bridge.signal().is_aborted());
    }

    #[tokio::test]
    async fn aborted_future_wakes_waiter() {
        let lifecycle = Lifecycle::new();
        let bridge = CancellationBridge::attach(&lifecycle);
        let signal = bridge.signal();

        let waiter = tokio::spawn(async move {
            signal.aborted().await;
            signal.is_aborted()
        });

        tokio::task::yield_now().await;
        lifecycle.close();

        assert!(waiter.await.unwrap());
    }
}
