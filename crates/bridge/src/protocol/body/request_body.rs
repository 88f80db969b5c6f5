use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use http::HeaderMap;
use http_body_util::BodyExt;
use mime::Mime;
use serde::de::DeserializeOwned;

use crate::protocol::BodyError;
use crate::protocol::body::ReqBody;

/// A decoded request body, shaped by its declared content type.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyValue {
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
}

/// The request body, consumable exactly once.
///
/// Every accessor claims the body when it is called, before its future is polled, so a second
/// call fails right away with [`BodyError::AlreadyConsumed`] whichever accessor came first.
#[derive(Debug)]
pub struct RequestBody {
    inner: Mutex<Option<ReqBody>>,
    content_type: Option<Mime>,
}

impl RequestBody {
    pub(crate) fn new(body: ReqBody, headers: &HeaderMap) -> Self {
        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Mime>().ok());
        Self { inner: Mutex::new(Some(body)), content_type }
    }

    /// The declared content type, if it parsed.
    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    pub fn is_consumed(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Takes the raw streaming body.
    pub fn take(&self) -> Result<ReqBody, BodyError> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).take().ok_or(BodyError::AlreadyConsumed)
    }

    /// Collects the whole body into one buffer.
    pub fn bytes(&self) -> impl Future<Output = Result<Bytes, BodyError>> + Send + 'static {
        let body = self.take();
        async move { Ok(body?.collect().await?.to_bytes()) }
    }

    /// Collects the body and decodes it as text.
    ///
    /// Only UTF-8 (the default when no charset is declared) is supported.
    pub fn text(&self) -> impl Future<Output = Result<String, BodyError>> + Send + 'static {
        let charset = self.charset();
        let bytes = self.bytes();
        async move {
            check_charset(charset.as_deref())?;
            decode_utf8(bytes.await?)
        }
    }

    /// Collects the body and deserializes it from JSON.
    pub fn json<T>(&self) -> impl Future<Output = Result<T, BodyError>> + Send + 'static
    where
        T: DeserializeOwned,
    {
        let bytes = self.bytes();
        async move { serde_json::from_slice(&bytes.await?).map_err(BodyError::decode) }
    }

    /// Collects the body and decodes it according to the declared content type.
    ///
    /// JSON media types (`application/json`, `*/*+json`) become [`BodyValue::Json`], `text/*`
    /// becomes [`BodyValue::Text`], anything else is left as raw bytes.
    pub fn parse(&self) -> impl Future<Output = Result<BodyValue, BodyError>> + Send + 'static {
        let kind = self.content_type.as_ref().map_or(Kind::Raw, Kind::of);
        let charset = self.charset();
        let bytes = self.bytes();
        async move {
            let bytes = bytes.await?;
            match kind {
                Kind::Json => serde_json::from_slice(&bytes).map(BodyValue::Json).map_err(BodyError::decode),
                Kind::Text => {
                    check_charset(charset.as_deref())?;
                    decode_utf8(bytes).map(BodyValue::Text)
                }
                Kind::Raw => Ok(BodyValue::Bytes(bytes)),
            }
        }
    }

    fn charset(&self) -> Option<String> {
        self.content_type.as_ref().and_then(|mime| mime.get_param(mime::CHARSET)).map(|charset| charset.as_str().to_owned())
    }
}

enum Kind {
    Json,
    Text,
    Raw,
}

impl Kind {
    fn of(mime: &Mime) -> Self {
        if mime.subtype() == mime::JSON || mime.suffix() == Some(mime::JSON) {
            Kind::Json
        } else if mime.type_() == mime::TEXT {
            Kind::Text
        } else {
            Kind::Raw
        }
    }
}

fn check_charset(charset: Option<&str>) -> Result<(), BodyError> {
    match charset {
        None => Ok(()),
        Some(charset) if charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8") => Ok(()),
        Some(charset) => Err(BodyError::UnsupportedCharset { charset: charset.to_owned() }),
    }
}

fn decode_utf8(bytes: Bytes) -> Result<String, BodyError> {
    String::from_utf8(bytes.into()).map_err(|e| BodyError::decode(format!("request body is not utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationBridge;
    use crate::connection::Lifecycle;
    use crate::protocol::PayloadSize;
    use crate::protocol::body::{InboundSender, chunk_channel};
    use http::HeaderValue;
    use serde::Deserialize;

    fn request_body(content_type: Option<&'static str>) -> (InboundSender, RequestBody, Lifecycle) {
        let lifecycle = Lifecycle::new();
        let bridge = CancellationBridge::attach(&lifecycle);
        let (sender, source) = chunk_channel();
        let mut headers = HeaderMap::new();
        if let Some(content_type) = content_type {
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        let body = ReqBody::new(source, bridge.signal(), PayloadSize::Chunked, None);
        (sender, RequestBody::new(body, &headers), lifecycle)
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Recipe {
        id: u32,
    }

    #[tokio::test]
    async fn second_materialization_fails_whichever_came_first() {
        let (sender, body, _lifecycle) = request_body(None);
        sender.push_data(Bytes::from_static(b"{\"id\":2}"));
        sender.push_end();

        let recipe: Recipe = body.json().await.unwrap();
        assert_eq!(recipe, Recipe { id: 2 });

        assert!(body.is_consumed());
        assert!(matches!(body.bytes().await, Err(BodyError::AlreadyConsumed)));
        assert!(matches!(body.text().await, Err(BodyError::AlreadyConsumed)));
        assert!(matches!(body.parse().await, Err(BodyError::AlreadyConsumed)));
        assert!(matches!(body.take(), Err(BodyError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn consumption_is_claimed_at_call_time() {
        let (sender, body, _lifecycle) = request_body(None);

        let pending = body.bytes();
        assert!(matches!(body.take(), Err(BodyError::AlreadyConsumed)));

        sender.push_data(Bytes::from_static(b"ok"));
        sender.push_end();
        assert_eq!(pending.await.unwrap(), Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn empty_body_collects_to_empty_buffer() {
        let (sender, body, _lifecycle) = request_body(None);
        sender.push_end();

        assert!(body.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_decode_error() {
        let (sender, body, _lifecycle) = request_body(Some("application/json"));
        sender.push_data(Bytes::from_static(b"{\"id\":"));
        sender.push_end();

        assert!(matches!(body.parse().await, Err(BodyError::Decode { .. })));
    }

    #[tokio::test]
    async fn parse_follows_content_type() {
        let (sender, body, _lifecycle) = request_body(Some("application/vnd.api+json"));
        sender.push_data(Bytes::from_static(b"[1,2]"));
        sender.push_end();
        assert_eq!(body.parse().await.unwrap(), BodyValue::Json(serde_json::json!([1, 2])));

        let (sender, body, _lifecycle) = request_body(Some("text/plain; charset=utf-8"));
        sender.push_data(Bytes::from_static("héllo".as_bytes()));
        sender.push_end();
        assert_eq!(body.parse().await.unwrap(), BodyValue::Text("héllo".to_owned()));

        let (sender, body, _lifecycle) = request_body(Some("application/octet-stream"));
        sender.push_data(Bytes::from_static(&[0, 159, 146, 150]));
        sender.push_end();
        assert_eq!(body.parse().await.unwrap(), BodyValue::Bytes(Bytes::from_static(&[0, 159, 146, 150])));
    }

    #[tokio::test]
    async fn text_rejects_invalid_utf8_and_other_charsets() {
        let (sender, body, _lifecycle) = request_body(None);
        sender.push_data(Bytes::from_static(&[0xc3, 0x28]));
        sender.push_end();
        assert!(matches!(body.text().await, Err(BodyError::Decode { .. })));

        let (sender, body, _lifecycle) = request_body(Some("text/plain; charset=latin1"));
        sender.push_end();
        assert!(matches!(body.text().await, Err(BodyError::UnsupportedCharset { .. })));
    }

    #[tokio::test]
    async fn pending_materialization_resolves_on_abort() {
        let (_sender, body, lifecycle) = request_body(None);

        let pending = tokio::spawn(body.bytes());
        tokio::task::yield_now().await;
        lifecycle.close();

        assert!(pending.await.unwrap().unwrap_err().is_aborted());
    }
}
