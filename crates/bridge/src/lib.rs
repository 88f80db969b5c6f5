//! Standard request/response handlers on top of event-driven connections
//!
//! A host that speaks in callbacks (data arrived, input ended, connection closed, output
//! drained) and application code that wants an `http::Request`-like value with a lazily read
//! body and returns an `http::Response` do not fit together on their own. This crate sits in
//! between: it turns pushed inbound chunks into a pull-based body, drains the response onto a
//! writable that signals backpressure, and turns a vanished client into an abort signal every
//! party can observe.
//!
//! # Example
//!
//! ```
//! use http::{Method, Response};
//! use micro_bridge::config::AdapterConfig;
//! use micro_bridge::connection::{RequestHead, memory};
//! use micro_bridge::dispatcher::Dispatcher;
//! use micro_bridge::handler::make_handler;
//! use micro_bridge::protocol::BodyError;
//! use micro_bridge::request::WebRequest;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let dispatcher = Dispatcher::new(make_handler(shout), AdapterConfig::default());
//!
//!     let head = RequestHead::new(Method::POST, "/shout".parse().unwrap());
//!     let (connection, peer) = memory::pair(head);
//!     peer.send("hello");
//!
//!     let outcome = dispatcher.dispatch(connection).await.unwrap();
//!     assert!(!outcome.is_aborted());
//!     assert_eq!(&peer.finished().await[..], b"HELLO");
//! }
//!
//! async fn shout(request: WebRequest) -> Result<Response<String>, BodyError> {
//!     let text = request.body().text().await?;
//!     Ok(Response::new(text.to_uppercase()))
//! }
//! ```
//!
//! # Architecture
//!
//! - [`connection`]: what a host provides: request metadata, inbound events, a [`Writable`](connection::Writable)
//! - [`protocol`]: bodies, payload types and errors
//! - [`cancel`]: connection teardown turned into an [`AbortSignal`](cancel::AbortSignal)
//! - [`request`]: assembly of the [`WebRequest`](request::WebRequest) handlers receive
//! - [`writer`]: draining a response with backpressure and cancellation
//! - [`dispatcher`]: one connection through adapt, handle, write
//! - [`handler`]: the application trait
//! - [`codec`]: HTTP/1.1 response framing for hosts on plain byte streams
//! - [`config`]: adapter settings
//!
//! # Flow control
//!
//! Inbound chunks are queued until the body is read; the first read flips the connection to
//! flowing, which is when a host pausing its transport should resume it. Outbound, a chunk is
//! never written while the writable is reporting backpressure, and whatever was written is flushed
//! whenever the response body has nothing ready.
//!
//! # Cancellation
//!
//! A close or error reported before the response completed aborts the request. Pending body
//! reads fail with [`BodyError::Aborted`](protocol::BodyError::Aborted), the writer stops pulling
//! the response body, and callbacks registered with
//! [`AbortSignal::on_abort`](cancel::AbortSignal::on_abort) run in registration order. Handlers are
//! never interrupted; they learn about the abort through the signal.
//!
//! # Limitations
//!
//! - One request per connection
//! - No timeouts; a host enforces them by closing the connection

pub mod cancel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod protocol;
pub mod request;
pub mod writer;
