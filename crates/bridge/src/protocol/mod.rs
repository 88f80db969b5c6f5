//! Protocol types shared by the connection, request and response halves of the bridge.
//!
//! - [`message`]: payload items and sizes handed between queues and encoders
//! - [`body`]: inbound and outbound bodies
//! - [`header_case`]: original header-name spelling for pass-through
//! - [`error`]: error types for each failure domain
//!
//! # Error Handling
//!
//! - [`BodyError`]: reading or materializing a request body
//! - [`SendError`]: draining a response onto a connection
//! - [`ParseError`]: building request metadata from raw host input
//! - [`HttpError`]: top-level error of a dispatch

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod header_case;
pub use header_case::HeaderCaseMap;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::BodyError;
pub use error::BoxError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod body;
