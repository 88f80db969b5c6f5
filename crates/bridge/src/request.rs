//! Assembly of the standard request handed to handlers.

use std::net::{IpAddr, SocketAddr};

use http::header::{self, HeaderName};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, HeaderValue, Method, Uri, Version};
use tracing::{trace, warn};

use crate::cancel::AbortSignal;
use crate::config::AdapterConfig;
use crate::connection::RequestHead;
use crate::protocol::body::{ChunkSource, ReqBody, RequestBody};
use crate::protocol::{HeaderCaseMap, PayloadSize};

const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// A request as application handlers see it.
///
/// The URI is always absolute. Header lookups are case-insensitive; the spelling the client used
/// is kept in [`header_case`](Self::header_case). The body can be consumed once.
#[derive(Debug)]
pub struct WebRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    header_case: HeaderCaseMap,
    client_addr: Option<SocketAddr>,
    forwarded_for: Option<IpAddr>,
    body: RequestBody,
    signal: AbortSignal,
}

impl WebRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The first value of `name` if it is visible ASCII.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn header_case(&self) -> &HeaderCaseMap {
        &self.header_case
    }

    /// Headers value by value, each with the name spelled as the client sent it.
    pub fn cased_headers(&self) -> impl Iterator<Item = (&[u8], &HeaderValue)> {
        self.header_case.cased(&self.headers)
    }

    /// The peer address of the connection.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// The client's IP: the first `x-forwarded-for` hop when forwarded headers are trusted,
    /// the peer address otherwise.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.forwarded_for.or_else(|| self.client_addr.map(|addr| addr.ip()))
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Aborted once the client goes away before the response is complete.
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }
}

/// Turns connection metadata into a [`WebRequest`].
#[derive(Debug, Clone, Copy)]
pub struct RequestAdapter<'a> {
    config: &'a AdapterConfig,
}

impl<'a> RequestAdapter<'a> {
    pub fn new(config: &'a AdapterConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, head: RequestHead, source: ChunkSource, signal: AbortSignal) -> WebRequest {
        let uri = self.resolve_uri(&head);
        let forwarded_for = if self.config.trust_forwarded_headers { forwarded_for(head.headers()) } else { None };

        let parts = head.into_parts();
        let payload_size = payload_size(&parts.headers);
        let body = RequestBody::new(ReqBody::new(source, signal.clone(), payload_size, self.config.body_limit), &parts.headers);

        WebRequest {
            method: parts.method,
            uri,
            version: parts.version,
            headers: parts.headers,
            header_case: parts.header_case,
            client_addr: parts.remote_addr,
            forwarded_for,
            body,
            signal,
        }
    }

    fn resolve_uri(&self, head: &RequestHead) -> Uri {
        let target = head.uri();
        if target.scheme().is_some() && target.authority().is_some() {
            return target.clone();
        }

        let scheme = self.resolve_scheme(head);
        let authority = self.resolve_authority(head);
        let path_and_query = target.path_and_query().cloned().unwrap_or_else(|| PathAndQuery::from_static("/"));

        match Uri::builder().scheme(scheme).authority(authority).path_and_query(path_and_query).build() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(cause = %e, uri = %target, "can't make request uri absolute, keeping it as received");
                target.clone()
            }
        }
    }

    fn resolve_scheme(&self, head: &RequestHead) -> Scheme {
        let forwarded = self
            .config
            .trust_forwarded_headers
            .then(|| first_value(head.headers(), &X_FORWARDED_PROTO))
            .flatten()
            .and_then(|proto| Scheme::try_from(proto).ok());

        if let Some(scheme) = forwarded {
            trace!(%scheme, "scheme from x-forwarded-proto");
            return scheme;
        }
        if head.is_secure() {
            return Scheme::HTTPS;
        }
        Scheme::try_from(self.config.default_scheme.as_str()).unwrap_or(Scheme::HTTP)
    }

    fn resolve_authority(&self, head: &RequestHead) -> Authority {
        let headers = head.headers();
        let forwarded = self
            .config
            .trust_forwarded_headers
            .then(|| first_value(headers, &X_FORWARDED_HOST))
            .flatten()
            .and_then(|host| Authority::try_from(host).ok());

        forwarded
            .or_else(|| head.uri().authority().cloned())
            .or_else(|| headers.get(header::HOST).and_then(|host| Authority::try_from(host.as_bytes()).ok()))
            .or_else(|| head.local_authority().cloned())
            .or_else(|| Authority::try_from(self.config.default_host.as_str()).ok())
            .unwrap_or_else(|| Authority::from_static("localhost"))
    }
}

/// The first comma-separated entry of a header, trimmed.
fn first_value<'h>(headers: &'h HeaderMap, name: &HeaderName) -> Option<&'h str> {
    let value = headers.get(name)?.to_str().ok()?;
    value.split(',').map(str::trim).find(|entry| !entry.is_empty())
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    first_value(headers, &X_FORWARDED_FOR).and_then(|ip| ip.parse().ok())
}

fn payload_size(headers: &HeaderMap) -> PayloadSize {
    let chunked = headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return PayloadSize::Chunked;
    }

    match headers.get(header::CONTENT_LENGTH).and_then(|value| value.to_str().ok()).and_then(|value| value.trim().parse::<u64>().ok()) {
        Some(0) => PayloadSize::Empty,
        Some(length) => PayloadSize::Length(length),
        None => PayloadSize::Chunked,
    }
}
