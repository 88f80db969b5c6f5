//! Request metadata as delivered by the host.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::HeaderName;
use http::uri::Authority;
use http::{HeaderMap, HeaderValue, Method, Uri, Version};

use crate::protocol::{HeaderCaseMap, ParseError};

/// Method, target, headers and transport facts of one request.
///
/// Header names are stored normalized for lookup; their original spelling is kept in a
/// [`HeaderCaseMap`].
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    header_case: HeaderCaseMap,
    remote_addr: Option<SocketAddr>,
    local_authority: Option<Authority>,
    secure: bool,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            header_case: HeaderCaseMap::new(),
            remote_addr: None,
            local_authority: None,
            secure: false,
        }
    }

    /// Appends a header as it appeared on the wire.
    pub fn append_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), ParseError> {
        let header_name = HeaderName::from_bytes(name).map_err(ParseError::invalid_header)?;
        let header_value = HeaderValue::from_bytes(value).map_err(ParseError::invalid_header)?;

        self.header_case.append(&header_name, Bytes::copy_from_slice(name));
        self.headers.append(header_name, header_value);
        Ok(())
    }

    /// Builder flavour of [`append_header`](Self::append_header).
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ParseError> {
        self.append_header(name.as_bytes(), value.as_bytes())?;
        Ok(self)
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    /// The authority the connection was accepted on, used when the request names no host.
    pub fn with_local_authority(mut self, authority: Authority) -> Self {
        self.local_authority = Some(authority);
        self
    }

    /// Marks the connection as TLS-terminated by the host.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

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

    pub fn header_case(&self) -> &HeaderCaseMap {
        &self.header_case
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_authority(&self) -> Option<&Authority> {
        self.local_authority.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub(crate) fn into_parts(self) -> RequestHeadParts {
        RequestHeadParts {
            method: self.method,
            uri: self.uri,
            version: self.version,
            headers: self.headers,
            header_case: self.header_case,
            remote_addr: self.remote_addr,
        }
    }
}

pub(crate) struct RequestHeadParts {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) header_case: HeaderCaseMap,
    pub(crate) remote_addr: Option<SocketAddr>,
}

/// Converts a request parsed by `httparse`, keeping header spelling.
impl TryFrom<&httparse::Request<'_, '_>> for RequestHead {
    type Error = ParseError;

    fn try_from(req: &httparse::Request<'_, '_>) -> Result<Self, Self::Error> {
        let method = req.method.ok_or(ParseError::InvalidMethod)?;
        let method = Method::from_bytes(method.as_bytes()).map_err(|_e| ParseError::InvalidMethod)?;
        let uri = req.path.ok_or(ParseError::InvalidUri)?.parse::<Uri>().map_err(|_e| ParseError::InvalidUri)?;
        let version = match req.version {
            Some(1) => Version::HTTP_11,
            Some(0) => Version::HTTP_10,
            other => return Err(ParseError::InvalidVersion(other)),
        };

        let mut head = RequestHead::new(method, uri).with_version(version);
        head.headers.reserve(req.headers.len());
        for header in req.headers.iter() {
            head.append_header(header.name.as_bytes(), header.value)?;
        }
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn from_curl() {
        let str = indoc! {r##"
        GET /index.html?a=1 HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        X-Test: 1

        "##};

        let mut headers = [httparse::EMPTY_HEADER; 8];
        let mut parsed_req = httparse::Request::new(&mut headers);
        parsed_req.parse(str.as_bytes()).unwrap();

        let head = RequestHead::try_from(&parsed_req).unwrap();

        assert_eq!(head.method(), &Method::GET);
        assert_eq!(head.version(), Version::HTTP_11);
        assert_eq!(head.uri().path(), "/index.html");
        assert_eq!(head.uri().query(), Some("a=1"));
        assert_eq!(head.headers().len(), 3);
        assert_eq!(head.headers().get("x-test").unwrap(), "1");

        let cased: Vec<_> = head.header_case().get_all(&HeaderName::from_static("x-test")).cloned().collect();
        assert_eq!(cased, vec![Bytes::from_static(b"X-Test")]);
    }

    #[test]
    fn rejects_invalid_header_name() {
        let head = RequestHead::new(Method::GET, Uri::from_static("/"));
        assert!(matches!(head.with_header("bad header", "1"), Err(ParseError::InvalidHeader { .. })));
    }
}
