//! Response head type.

use http::Response;

/// The header portion of a response, before any body byte is written.
///
/// A [`HeaderCaseMap`](crate::protocol::HeaderCaseMap) in its extensions, when present, decides
/// how header names are spelled on the wire.
pub type ResponseHead = Response<()>;
