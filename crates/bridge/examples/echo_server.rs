//! Serves one request per TCP connection and echoes its body back.
//!
//! ```sh
//! curl -v -H 'X-Request-Id: 42' -d 'hello' http://127.0.0.1:8080/echo
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use http::uri::Authority;
use http::{Response, StatusCode, header};
use micro_bridge::config::AdapterConfig;
use micro_bridge::connection::RequestHead;
use micro_bridge::connection::io::connection;
use micro_bridge::dispatcher::Dispatcher;
use micro_bridge::handler::{Handler, make_handler};
use micro_bridge::protocol::body::ResponseBody;
use micro_bridge::protocol::{BoxError, HeaderCaseMap};
use micro_bridge::request::WebRequest;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

const MAX_HEAD_SIZE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let addr: SocketAddr = ([127, 0, 0, 1], 8080).into();
    info!(%addr, "start listening");
    let tcp_listener = match TcpListener::bind(addr).await {
        Ok(tcp_listener) => tcp_listener,
        Err(e) => {
            error!(cause = %e, "bind server error");
            return;
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(make_handler(echo), AdapterConfig::new().body_limit(1024 * 1024)));

    loop {
        let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
            Ok(stream_and_addr) => stream_and_addr,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                continue;
            }
        };

        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = serve(&dispatcher, tcp_stream, remote_addr).await {
                error!(cause = %e, "connection failed");
            }
        });
    }
}

async fn echo(req: WebRequest) -> Result<Response<ResponseBody>, BoxError> {
    info!(method = %req.method(), uri = %req.uri(), client = ?req.client_ip(), "echo request");

    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(content_type) = req.headers().get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    // x-request-id goes back spelled the way the client sent it
    let request_id = header::HeaderName::from_static("x-request-id");
    if let Some(value) = req.headers().get(&request_id) {
        builder = builder.header(&request_id, value);
    }

    let body = req.body().take()?;
    let mut response = builder.body(ResponseBody::stream(body))?;
    response.extensions_mut().insert::<HeaderCaseMap>(req.header_case().clone());
    Ok(response)
}

async fn serve<H: Handler>(dispatcher: &Dispatcher<H>, mut tcp_stream: TcpStream, remote_addr: SocketAddr) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(MAX_HEAD_SIZE);
    let (head, head_len) = loop {
        if tcp_stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        if let Some(parsed) = parse_head(&buf)? {
            break parsed;
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
    };
    let leftover = buf.split_off(head_len).freeze();

    let content_length = head.headers().get(header::CONTENT_LENGTH).and_then(|value| value.to_str().ok()).and_then(|value| value.parse::<u64>().ok()).unwrap_or(0);
    let mut head = head.with_remote_addr(remote_addr);
    if let Ok(local_addr) = tcp_stream.local_addr()
        && let Ok(authority) = Authority::try_from(local_addr.to_string().as_str())
    {
        head = head.with_local_authority(authority);
    }

    let (reader, writer) = tcp_stream.into_split();
    let (connection, handle) = connection(head, writer);

    let inbound = handle.read_from((&leftover[..]).chain(reader), content_length);
    let dispatching = dispatcher.dispatch(connection);
    tokio::pin!(inbound, dispatching);

    let outcome = tokio::select! {
        outcome = &mut dispatching => outcome,
        () = &mut inbound => dispatching.await,
    }
    .map_err(io::Error::other)?;
    info!(?outcome, "connection finished");
    Ok(())
}

fn parse_head(buf: &[u8]) -> io::Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))? {
        httparse::Status::Complete(head_len) => {
            let head = RequestHead::try_from(&parsed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some((head, head_len)))
        }
        httparse::Status::Partial => Ok(None),
    }
}
