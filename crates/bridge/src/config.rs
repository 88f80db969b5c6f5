//! Adapter settings.
//!
//! [`AdapterConfig`] deserializes from any serde format; missing fields keep their defaults.

use serde::Deserialize;

/// How requests are assembled from connection metadata.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Scheme used when neither a trusted forwarded header nor the connection names one
    pub default_scheme: String,
    /// Authority used when the request carries no host and the connection has no local authority
    pub default_host: String,
    /// Honor `x-forwarded-proto` and `x-forwarded-host`. Only enable behind a proxy that sets them.
    pub trust_forwarded_headers: bool,
    /// Largest request body accepted, in bytes
    pub body_limit: Option<u64>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self { default_scheme: "http".to_owned(), default_host: "localhost".to_owned(), trust_forwarded_headers: false, body_limit: None }
    }
}

impl AdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.default_scheme = scheme.into();
        self
    }

    pub fn default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = host.into();
        self
    }

    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    pub fn body_limit(mut self, limit: u64) -> Self {
        self.body_limit = Some(limit);
        self
    }
}
