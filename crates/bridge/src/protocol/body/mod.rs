//! Request and response bodies.
//!
//! The inbound side turns host-pushed events into a pull-based body:
//!
//! - [`InboundSender`]: the host's end, accepting data, end and error events at any time
//! - [`ChunkSource`]: the consumer's end, an explicit state-machine queue with a single parked
//!   consumer slot
//! - [`ReqBody`]: the queue as an `http_body::Body`, aware of request cancellation
//! - [`RequestBody`]: a consume-once handle with buffer, text, JSON and content-type driven
//!   materializations
//!
//! The outbound side is [`ResponseBody`], which is absent, a fixed buffer or a stream.

mod chunk_source;
mod req_body;
mod request_body;
mod response_body;

pub use chunk_source::{ChunkSource, InboundSender, chunk_channel};
pub use req_body::ReqBody;
pub use request_body::{BodyValue, RequestBody};
pub use response_body::ResponseBody;

pub(crate) use response_body::Payload;
