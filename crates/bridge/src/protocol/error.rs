use std::error::Error;
use std::io;

use http::StatusCode;
use thiserror::Error;

use crate::cancel::AbortReason;

/// Boxed error used at the handler boundary.
pub type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },
}

/// Errors raised while a host turns raw request metadata into a [`RequestHead`](crate::connection::RequestHead).
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,
}

impl ParseError {
    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }
}

/// Errors surfaced while reading or materializing a request body.
#[derive(Error, Debug)]
pub enum BodyError {
    #[error("body has already been consumed")]
    AlreadyConsumed,

    #[error("body read aborted: {0}")]
    Aborted(AbortReason),

    #[error("body exceeds the limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("can't decode body: {reason}")]
    Decode { reason: String },

    #[error("unsupported charset: {charset}")]
    UnsupportedCharset { charset: String },

    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: io::Error,
    },
}

impl BodyError {
    pub fn decode<S: ToString>(str: S) -> Self {
        Self::Decode { reason: str.to_string() }
    }

    pub fn transport<E: Into<io::Error>>(e: E) -> Self {
        Self::Transport { source: e.into() }
    }

    /// True when the read stopped because the client went away, not because something broke.
    pub fn is_aborted(&self) -> bool {
        matches!(self, BodyError::Aborted(_))
    }

    /// The status a handler would usually answer with when it gives up on this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BodyError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BodyError::UnsupportedCharset { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            BodyError::Decode { .. } | BodyError::Transport { .. } | BodyError::Aborted(_) => StatusCode::BAD_REQUEST,
            BodyError::AlreadyConsumed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors raised while draining a response onto a connection.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("content-length declared {declared} bytes but body produced {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("response body error: {source}")]
    Body { source: BoxError },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn length_mismatch(declared: u64, actual: u64) -> Self {
        Self::LengthMismatch { declared, actual }
    }

    pub fn body<E: Into<BoxError>>(e: E) -> Self {
        Self::Body { source: e.into() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
