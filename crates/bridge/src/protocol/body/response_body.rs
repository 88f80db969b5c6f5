use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};

use crate::protocol::BoxError;

/// A response body: absent, one fixed buffer, or a lazily produced stream.
pub struct ResponseBody {
    inner: Kind,
}

enum Kind {
    Empty,
    Full(Option<Bytes>),
    Stream(UnsyncBoxBody<Bytes, BoxError>),
}

/// The three shapes a [`ResponseBody`] can take, as seen by the writer.
pub(crate) enum Payload {
    Empty,
    Full(Bytes),
    Stream(UnsyncBoxBody<Bytes, BoxError>),
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self { inner: Kind::Empty }
    }

    pub fn full(bytes: impl Into<Bytes>) -> Self {
        Self { inner: Kind::Full(Some(bytes.into())) }
    }

    pub fn stream<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self { inner: Kind::Stream(body.map_err(|e| -> BoxError { e.into() }).boxed_unsync()) }
    }

    /// Wraps a stream of byte chunks.
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::stream(StreamBody::new(stream.map_ok(Frame::data).map_err(|e| -> BoxError { e.into() })))
    }

    pub(crate) fn into_payload(self) -> Payload {
        match self.inner {
            Kind::Empty | Kind::Full(None) => Payload::Empty,
            Kind::Full(Some(bytes)) => Payload::Full(bytes),
            Kind::Stream(body) => Payload::Stream(body),
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Kind::Empty => f.write_str("ResponseBody::Empty"),
            Kind::Full(bytes) => f.debug_tuple("ResponseBody::Full").field(bytes).finish(),
            Kind::Stream(_) => f.write_str("ResponseBody::Stream"),
        }
    }
}

impl Default for ResponseBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        Self::full(value)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(value: Vec<u8>) -> Self {
        Self::full(value)
    }
}

impl From<Bytes> for ResponseBody {
    fn from(value: Bytes) -> Self {
        Self::full(value)
    }
}

impl From<()> for ResponseBody {
    fn from((): ()) -> Self {
        Self::empty()
    }
}

impl From<Option<Bytes>> for ResponseBody {
    fn from(option: Option<Bytes>) -> Self {
        match option {
            Some(bytes) => Self::full(bytes),
            None => Self::empty(),
        }
    }
}

impl From<&'static str> for ResponseBody {
    fn from(value: &'static str) -> Self {
        Self::full(Bytes::from_static(value.as_bytes()))
    }
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().inner {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(option_bytes) => Poll::Ready(option_bytes.take().map(|bytes| Ok(Frame::data(bytes)))),
            Kind::Stream(box_body) => Pin::new(box_body).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            Kind::Empty => true,
            Kind::Full(option_bytes) => option_bytes.is_none(),
            Kind::Stream(box_body) => box_body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Kind::Empty | Kind::Full(None) => SizeHint::with_exact(0),
            Kind::Full(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            Kind::Stream(box_body) => box_body.size_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn check_send<T: Send>() {}

    #[test]
    fn is_send() {
        check_send::<ResponseBody>();
    }

    #[tokio::test]
    async fn string_body() {
        let s = "Hello world".to_string();
        let len = s.len() as u64;

        let mut body = ResponseBody::from(s);

        assert_eq!(body.size_hint().exact(), Some(len));
        assert!(!body.is_end_stream());

        let bytes = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(bytes, Bytes::from("Hello world"));

        assert!(body.is_end_stream());
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn stream_body() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![Ok(Bytes::from(vec![1])), Ok(Bytes::from(vec![2])), Ok(Bytes::from(vec![3]))];
        let mut body = ResponseBody::from_stream(futures::stream::iter(chunks));

        assert!(body.size_hint().exact().is_none());
        assert_eq!(body.frame().await.unwrap().unwrap().into_data().unwrap().as_ref(), [1]);
        assert_eq!(body.frame().await.unwrap().unwrap().into_data().unwrap().as_ref(), [2]);
        assert_eq!(body.frame().await.unwrap().unwrap().into_data().unwrap().as_ref(), [3]);
        assert!(body.frame().await.is_none());
    }

    #[test]
    fn payload_shapes() {
        assert!(matches!(ResponseBody::empty().into_payload(), Payload::Empty));
        assert!(matches!(ResponseBody::from(()).into_payload(), Payload::Empty));
        assert!(matches!(ResponseBody::from("abc").into_payload(), Payload::Full(bytes) if bytes == "abc"));
        let stream = futures::stream::empty::<Result<Bytes, io::Error>>();
        assert!(matches!(ResponseBody::from_stream(stream).into_payload(), Payload::Stream(_)));
    }
}
