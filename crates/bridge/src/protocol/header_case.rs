//! Original header-name casing.
//!
//! `http::HeaderMap` normalizes every name to lowercase, which is what lookups want but not what
//! a peer sent. [`HeaderCaseMap`] remembers the spelling of each occurrence, in the same order as
//! the values in the corresponding `HeaderMap`, so a header can be echoed back exactly as received.
//! Responses carry it in their extensions.

use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderMap, HeaderValue};

#[derive(Clone, Debug, Default)]
pub struct HeaderCaseMap(HeaderMap<Bytes>);

impl HeaderCaseMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the original spelling of the next value appended under `name`.
    pub fn append(&mut self, name: &HeaderName, original: Bytes) {
        self.0.append(name, original);
    }

    /// The recorded spellings for `name`, one per value.
    pub fn get_all<'a>(&'a self, name: &HeaderName) -> impl Iterator<Item = &'a Bytes> + 'a {
        self.0.get_all(name).iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates `headers` value by value, pairing each with the name as it should go on the wire.
    ///
    /// Values without a recorded spelling fall back to the lowercase name.
    pub fn cased<'a>(&'a self, headers: &'a HeaderMap) -> impl Iterator<Item = (&'a [u8], &'a HeaderValue)> + 'a {
        headers.keys().flat_map(move |name| {
            let mut spellings = self.0.get_all(name).iter();
            headers.get_all(name).iter().map(move |value| {
                let spelled = spellings.next().map_or(name.as_str().as_bytes(), |spelling| &spelling[..]);
                (spelled, value)
            })
        })
    }
}
