//! Transport seam between the hub and the WebSocket library.
//!
//! The engine only needs a write half ([`FrameSink`]) and a read half
//! ([`FrameStream`]). `tokio-tungstenite` streams are adapted here; anything
//! else that can move frames (an upgraded stream from a host router, an
//! in-memory pair in tests) can implement the two traits and be handed to
//! [`Engine::serve`](crate::Engine::serve).

use std::borrow::Cow;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame as WsCloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::debug;

use crate::config::UpgraderConfig;
use crate::error::ConnectionError;
use crate::websocket::CloseStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

/// Payload of a close control frame. `code` is kept raw so that frames with
/// unknown codes can still be represented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(status: CloseStatus, reason: impl Into<String>) -> Self {
        Self {
            code: status.wire_code(),
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> Option<CloseStatus> {
        CloseStatus::try_from(self.code).ok()
    }
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.len(),
            Frame::Close(frame) => frame.as_ref().map_or(0, |f| 2 + f.reason.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn from_message(msg: Message) -> Option<Self> {
        let frame = match msg {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(frame) => Frame::Close(frame.map(|f| CloseFrame {
                code: u16::from(f.code),
                reason: f.reason.into_owned(),
            })),
            // Raw frames only show up when writing; never surfaced by reads.
            Message::Frame(_) => return None,
        };
        Some(frame)
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close(frame) => Message::Close(frame.map(|f| WsCloseFrame {
                code: CloseCode::from(f.code),
                reason: Cow::Owned(f.reason),
            })),
        }
    }
}

/// Write half of a connection. Calls are serialized by the owning session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), ConnectionError>;

    /// Flushes and releases the underlying connection.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Read half of a connection. One call in flight at a time.
#[async_trait]
pub trait FrameStream: Send {
    /// `None` once the connection is gone.
    async fn next_frame(&mut self) -> Option<Result<Frame, ConnectionError>>;
}

/// Metadata of the HTTP upgrade request a session was created from.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    path: String,
    query: Option<String>,
    headers: HeaderMap,
}

impl RequestInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn from_request(req: &Request) -> Self {
        Self {
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            headers: req.headers().clone(),
        }
    }
}

/// An upgraded connection, ready to be served by an engine.
pub struct Connection {
    sink: Box<dyn FrameSink>,
    stream: Box<dyn FrameStream>,
    request: RequestInfo,
}

impl Connection {
    pub fn new(sink: impl FrameSink + 'static, stream: impl FrameStream + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
            request: RequestInfo::default(),
        }
    }

    pub fn with_request(mut self, request: RequestInfo) -> Self {
        self.request = request;
        self
    }

    pub fn from_websocket<S>(ws: WebSocketStream<S>, request: RequestInfo) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self::new(WsSink(sink), WsStream(stream)).with_request(request)
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub(crate) fn into_parts(self) -> (Box<dyn FrameSink>, Box<dyn FrameStream>, RequestInfo) {
        (self.sink, self.stream, self.request)
    }
}

/// Performs the server side of the WebSocket handshake on `stream`.
pub async fn upgrade<S>(
    stream: S,
    config: &UpgraderConfig,
    max_message_size: usize,
) -> Result<Connection, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // tungstenite has no read buffer setting of its own.
    let stream = BufReader::with_capacity(config.read_buffer_size, stream);

    let mut ws_config = WebSocketConfig::default();
    ws_config.write_buffer_size = config.write_buffer_size;
    ws_config.max_message_size = Some(max_message_size);
    ws_config.max_frame_size = Some(max_message_size);

    let mut request = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        request = Some(RequestInfo::from_request(req));
        Ok(resp)
    };

    let ws = timeout(
        config.handshake_timeout,
        accept_hdr_async_with_config(stream, callback, Some(ws_config)),
    )
    .await
    .map_err(|_| {
        ConnectionError::Handshake(format!(
            "timed out after {:?}",
            config.handshake_timeout
        ))
    })?
    .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

    let request = request.unwrap_or_default();
    debug!("Upgraded connection on {}", request.path());
    Ok(Connection::from_websocket(ws, request))
}

struct WsSink<S>(SplitSink<WebSocketStream<S>, Message>);

struct WsStream<S>(SplitStream<WebSocketStream<S>>);

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let is_close = matches!(frame, Frame::Close(_));
        match self.0.send(frame.into()).await {
            Ok(()) => Ok(()),
            // tungstenite already queued its echo of the peer's close frame.
            Err(tungstenite::Error::Protocol(ProtocolError::SendAfterClosing)) if is_close => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match self.0.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<S> FrameStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<Frame, ConnectionError>> {
        loop {
            match self.0.next().await? {
                Ok(msg) => {
                    if let Some(frame) = Frame::from_message(msg) {
                        return Some(Ok(frame));
                    }
                }
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
