//! Driving one connection through a handler.
//!
//! [`Dispatcher::dispatch`] walks a connection through [`DispatchState`]: the request is adapted,
//! the handler runs to completion, its response is written, and the connection is done. A client
//! that goes away at any point aborts the request's signal; the dispatcher then skips whatever
//! writing is left and reports [`DispatchOutcome::Aborted`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use http::{Method, Response, StatusCode};
use tracing::{Instrument, debug, error, info, info_span};

use crate::cancel::{AbortReason, AbortSignal, CancellationBridge};
use crate::config::AdapterConfig;
use crate::connection::{Connection, Writable};
use crate::handler::Handler;
use crate::protocol::body::ResponseBody;
use crate::protocol::{BodyError, BoxError, HttpError};
use crate::request::RequestAdapter;
use crate::writer::{ResponseWriter, WriteOutcome};

/// Maps a handler failure to the response sent in its place.
pub type ErrorResponder = Arc<dyn Fn(&BoxError) -> Response<ResponseBody> + Send + Sync>;

/// Where a dispatch currently is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Adapting,
    Handling,
    Writing,
    Done,
}

/// How a dispatch finished.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The response was written in full
    Completed { status: StatusCode, bytes_written: u64 },
    /// The client went away before the response was complete
    Aborted(AbortReason),
}

impl DispatchOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, DispatchOutcome::Aborted(_))
    }
}

pub struct Dispatcher<H> {
    handler: H,
    config: AdapterConfig,
    error_responder: ErrorResponder,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: H, config: AdapterConfig) -> Self {
        Self { handler, config, error_responder: Arc::new(default_error_response) }
    }

    /// Replaces the mapping from handler failures to responses.
    ///
    /// The default answers a [`BodyError`] with its [`status_code`](BodyError::status_code) and
    /// anything else with an empty `500`.
    pub fn with_error_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&BoxError) -> Response<ResponseBody> + Send + Sync + 'static,
    {
        self.error_responder = Arc::new(responder);
        self
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Runs one connection to the end.
    ///
    /// Errors are reserved for responses that could not be written on a live connection; a
    /// client going away is an [`Aborted`](DispatchOutcome::Aborted) outcome.
    pub async fn dispatch<W: Writable>(&self, connection: Connection<W>) -> Result<DispatchOutcome, HttpError> {
        let span = info_span!("dispatch", method = %connection.head().method(), uri = %connection.head().uri());
        self.run(connection).instrument(span).await
    }

    async fn run<W: Writable>(&self, connection: Connection<W>) -> Result<DispatchOutcome, HttpError> {
        let mut state = DispatchState::Idle;
        let (head, source, lifecycle, mut writable) = connection.into_parts();
        let bridge = CancellationBridge::attach(&lifecycle);
        let signal = bridge.signal();

        transition(&mut state, DispatchState::Adapting);
        let omit_body = head.method() == Method::HEAD;
        let request = RequestAdapter::new(&self.config).build(head, source, signal.clone());

        transition(&mut state, DispatchState::Handling);
        let result = AssertUnwindSafe(self.handler.call(request)).catch_unwind().await;
        let response = match result {
            Ok(Ok(response)) => response.map(Into::into),
            Ok(Err(e)) => match self.failure_response(&signal, e.into()) {
                Some(response) => response,
                None => return Ok(aborted(&mut state, &signal)),
            },
            Err(panic) => match self.failure_response(&signal, panic_error(&*panic)) {
                Some(response) => response,
                None => return Ok(aborted(&mut state, &signal)),
            },
        };

        transition(&mut state, DispatchState::Writing);
        let status = response.status();
        let outcome = ResponseWriter::new(&mut writable, &signal).omit_body(omit_body).write(response).await?;

        transition(&mut state, DispatchState::Done);
        match outcome {
            WriteOutcome::Completed { bytes_written } => {
                bridge.complete();
                info!(%status, bytes_written, "request completed");
                Ok(DispatchOutcome::Completed { status, bytes_written })
            }
            WriteOutcome::Aborted(reason) => Ok(DispatchOutcome::Aborted(reason)),
        }
    }

    /// The response for a failed handler, or `None` when nobody is left to receive it.
    fn failure_response(&self, signal: &AbortSignal, e: BoxError) -> Option<Response<ResponseBody>> {
        if signal.is_aborted() {
            info!(cause = %e, "handler failed after the client went away");
            return None;
        }

        error!(cause = %e, "handler failed, send error response");
        Some((self.error_responder)(&e))
    }
}

impl<H> std::fmt::Debug for Dispatcher<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("config", &self.config).finish_non_exhaustive()
    }
}

fn transition(state: &mut DispatchState, next: DispatchState) {
    debug!(from = ?state, to = ?next, "dispatch state");
    *state = next;
}

fn aborted(state: &mut DispatchState, signal: &AbortSignal) -> DispatchOutcome {
    transition(state, DispatchState::Done);
    DispatchOutcome::Aborted(signal.reason().unwrap_or(AbortReason::ClientClosed))
}

fn panic_error(panic: &(dyn Any + Send)) -> BoxError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    format!("handler panicked: {message}").into()
}

fn default_error_response(error: &BoxError) -> Response<ResponseBody> {
    let status = error.downcast_ref::<BodyError>().map_or(StatusCode::INTERNAL_SERVER_ERROR, BodyError::status_code);
    let mut response = Response::new(ResponseBody::empty());
    *response.status_mut() = status;
    response
}
