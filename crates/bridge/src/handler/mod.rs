//! The application side of the bridge.
//!
//! A [`Handler`] takes a [`WebRequest`] and produces an `http::Response`. Plain async functions
//! and closures become handlers through [`make_handler`].

use std::future::Future;

use async_trait::async_trait;
use http::Response;

use crate::protocol::BoxError;
use crate::protocol::body::ResponseBody;
use crate::request::WebRequest;

#[async_trait]
pub trait Handler: Send + Sync {
    type RespBody: Into<ResponseBody>;
    type Error: Into<BoxError>;

    async fn call(&self, req: WebRequest) -> Result<Response<Self::RespBody>, Self::Error>;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<RespBody, Err, F, Fut> Handler for HandlerFn<F>
where
    RespBody: Into<ResponseBody>,
    F: Fn(WebRequest) -> Fut + Send + Sync,
    Err: Into<BoxError>,
    Fut: Future<Output = Result<Response<RespBody>, Err>> + Send,
{
    type RespBody = RespBody;
    type Error = Err;

    async fn call(&self, req: WebRequest) -> Result<Response<Self::RespBody>, Self::Error> {
        (self.f)(req).await
    }
}

pub fn make_handler<F, RespBody, Err, Ret>(f: F) -> HandlerFn<F>
where
    RespBody: Into<ResponseBody>,
    Err: Into<BoxError>,
    Ret: Future<Output = Result<Response<RespBody>, Err>>,
    F: Fn(WebRequest) -> Ret,
{
    HandlerFn { f }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for std::sync::Arc<H> {
    type RespBody = H::RespBody;
    type Error = H::Error;

    async fn call(&self, req: WebRequest) -> Result<Response<Self::RespBody>, Self::Error> {
        (**self).call(req).await
    }
}
