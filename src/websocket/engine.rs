use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{ConnectionError, HubError};
use crate::websocket::handlers::{
    BinaryHandler, CloseHandler, ErrorHandler, MessageHandler, SessionHandler,
};
use crate::websocket::transport::{self, Connection, Frame, FrameStream, RequestInfo};
use crate::websocket::{Bucket, CloseStatus, Handlers, Session};
use crate::Result;

/// Coordinates the life cycle of every connection: upgrade, registration,
/// heartbeat, read loop and close handshake.
///
/// Cloning is cheap; clones share the same registry and callbacks.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) sessions: Bucket,
    closed: AtomicBool,
    handlers: RwLock<Handlers>,
}

impl EngineInner {
    pub(crate) fn handlers(&self) -> Handlers {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_handlers(&self, update: impl FnOnce(&mut Handlers)) {
        update(&mut self.handlers.write().unwrap_or_else(PoisonError::into_inner));
    }
}

impl Engine {
    /// Builds an engine as configured, without checking the configuration.
    /// Use [`try_new`](Self::try_new) for values that come from outside.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                sessions: Bucket::new(),
                closed: AtomicBool::new(false),
                handlers: RwLock::new(Handlers::default()),
            }),
        }
    }

    /// Like [`new`](Self::new) but rejects a configuration that fails
    /// [`EngineConfig::validate`].
    pub fn try_new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn handle_connect<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: SessionHandler = Arc::new(move |session| handler(session).boxed());
        self.inner.update_handlers(|h| h.connect = Some(handler));
    }

    pub fn handle_message<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Session>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |session, msg| handler(session, msg).boxed());
        self.inner.update_handlers(|h| h.message = Some(handler));
    }

    pub fn handle_message_binary<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: BinaryHandler = Arc::new(move |session, msg| handler(session, msg).boxed());
        self.inner.update_handlers(|h| h.message_binary = Some(handler));
    }

    pub fn handle_error<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Session>, HubError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ErrorHandler = Arc::new(move |session, err| handler(session, err).boxed());
        self.inner.update_handlers(|h| h.error = Some(handler));
    }

    /// Called exactly once per session, however the session ends.
    pub fn handle_close<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Session>, CloseStatus, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: CloseHandler =
            Arc::new(move |session, status, reason| handler(session, status, reason).boxed());
        self.inner.update_handlers(|h| h.close = Some(handler));
    }

    /// Called after the close callback, only for `NormalClosure`.
    pub fn handle_disconnect<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: SessionHandler = Arc::new(move |session| handler(session).boxed());
        self.inner.update_handlers(|h| h.disconnect = Some(handler));
    }

    pub fn handle_pong<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: SessionHandler = Arc::new(move |session| handler(session).boxed());
        self.inner.update_handlers(|h| h.pong = Some(handler));
    }

    /// Upgrades `stream` to a WebSocket and serves it until the session
    /// closes.
    pub async fn handle_request<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_closed() {
            return Err(HubError::EngineClosed);
        }

        let config = &self.inner.config;
        match transport::upgrade(stream, &config.upgrader, config.max_message_size).await {
            Ok(connection) => self.serve(connection).await,
            Err(e) => {
                error!("Error during WebSocket handshake: {}", e);
                let err = HubError::from(e);
                let session = Session::detached(&self.inner, RequestInfo::default());
                session.error(err.clone()).await;
                Err(err)
            }
        }
    }

    /// Serves an already upgraded connection until its session closes.
    pub async fn serve(&self, connection: Connection) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::EngineClosed);
        }

        let (sink, mut stream, request) = connection.into_parts();
        let session = Session::new(&self.inner, sink, request);

        if let Err(e) = self.inner.sessions.put(session.clone()).await {
            session.error(e.clone()).await;
            return Err(e);
        }
        // `close()` may have taken its snapshot before we registered.
        if self.is_closed() {
            let _ = session.close(CloseStatus::GoingAway).await;
            return Err(HubError::EngineClosed);
        }

        info!(
            "Session {} connected on {}",
            session.id(),
            session.request().path()
        );

        self.inner.handlers().on_connect(&session).await;

        let heartbeat = self.spawn_heartbeat(&session);
        self.read_loop(&session, stream.as_mut()).await;

        // No-op unless the read loop exited without closing the session.
        let _ = session.close(CloseStatus::NormalClosure).await;
        if let Some(heartbeat) = heartbeat {
            if let Err(e) = heartbeat.await {
                error!("Heartbeat task of session {} failed: {}", session.id(), e);
            }
        }

        info!("Session {} finished", session.id());
        Ok(())
    }

    async fn read_loop(&self, session: &Arc<Session>, stream: &mut dyn FrameStream) {
        let config = &self.inner.config;

        loop {
            let next = tokio::select! {
                _ = session.closed() => break,
                next = next_frame(stream, session, config.read_wait()) => next,
            };

            match next {
                Ok(frame @ (Frame::Text(_) | Frame::Binary(_)))
                    if frame.len() > config.max_message_size =>
                {
                    warn!(
                        "Dropping {} byte message from session {}: exceeds {} bytes",
                        frame.len(),
                        session.id(),
                        config.max_message_size
                    );
                }
                Ok(Frame::Text(text)) => {
                    self.inner.handlers().on_message(session, text).await;
                }
                Ok(Frame::Binary(data)) => {
                    self.inner.handlers().on_message_binary(session, data).await;
                }
                Ok(Frame::Pong(_)) => {
                    session.touch_pong();
                    self.inner.handlers().on_pong(session).await;
                }
                Ok(Frame::Ping(_)) => {
                    // Answered by the transport.
                    debug!("Ping from session {}", session.id());
                }
                Ok(Frame::Close(frame)) => {
                    match frame.and_then(|f| f.status().map(|status| (status, f.reason))) {
                        Some((status, reason)) => {
                            info!("Session {} closed by peer with {}", session.id(), status);
                            session
                                .error(
                                    ConnectionError::Closed {
                                        status,
                                        reason: reason.clone(),
                                    }
                                    .into(),
                                )
                                .await;
                            // Any well-formed close from the peer is a cooperative shutdown.
                            let _ = session
                                .close_with_reason(CloseStatus::NormalClosure, &reason)
                                .await;
                        }
                        None => {
                            session
                                .error(
                                    ConnectionError::Closed {
                                        status: CloseStatus::NoStatusReceived,
                                        reason: String::new(),
                                    }
                                    .into(),
                                )
                                .await;
                            let _ = session.close(CloseStatus::AbnormalClosure).await;
                        }
                    }
                    break;
                }
                Err(e) => {
                    warn!("Error receiving from session {}: {}", session.id(), e);
                    session.error(e.into()).await;
                    let _ = session.close(CloseStatus::AbnormalClosure).await;
                    break;
                }
            }
        }
    }

    fn spawn_heartbeat(&self, session: &Arc<Session>) -> Option<JoinHandle<()>> {
        let period = self.inner.config.ping_period;
        if period.is_zero() {
            return None;
        }
        let pong_wait = self.inner.config.pong_wait;
        let session = session.clone();

        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = session.closed() => break,
                    _ = ticker.tick() => {}
                }

                if !pong_wait.is_zero() && session.last_pong().elapsed() >= pong_wait {
                    warn!("Heartbeat timeout for session {}", session.id());
                    session.error(ConnectionError::PongTimeout.into()).await;
                    let _ = session.close(CloseStatus::AbnormalClosure).await;
                    break;
                }

                match session.ping().await {
                    Ok(()) => {}
                    Err(HubError::SessionClosed) => break,
                    Err(e) => {
                        error!("Failed to send heartbeat for session {}: {}", session.id(), e);
                        session.error(e).await;
                        let _ = session.close(CloseStatus::AbnormalClosure).await;
                        break;
                    }
                }
            }
            debug!("Heartbeat stopped for session {}", session.id());
        }))
    }

    /// Broadcasts a text message to every registered session.
    pub async fn write(&self, msg: &str) -> usize {
        self.inner.sessions.write(msg).await
    }

    pub async fn write_filter<F>(&self, msg: &str, filter: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        self.inner.sessions.write_filter(msg, filter).await
    }

    pub async fn write_others(&self, msg: &str, excluded: &Session) -> usize {
        self.inner.sessions.write_others(msg, excluded).await
    }

    pub async fn write_binary(&self, msg: &[u8]) -> usize {
        self.inner.sessions.write_binary(msg).await
    }

    pub async fn write_binary_filter<F>(&self, msg: &[u8], filter: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        self.inner.sessions.write_binary_filter(msg, filter).await
    }

    pub async fn write_binary_others(&self, msg: &[u8], excluded: &Session) -> usize {
        self.inner.sessions.write_binary_others(msg, excluded).await
    }

    /// Rejects further upgrades and closes every registered session with
    /// `NormalClosure`. Later calls do nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing engine with {} sessions", self.len().await);
        self.inner.sessions.close(CloseStatus::NormalClosure).await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty().await
    }

    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.sessions().await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .field("handlers", &self.inner.handlers())
            .finish()
    }
}

/// Next frame from the peer, bounded by the read deadline (last pong +
/// `read_wait`) when there is one. A stream that ends without a close frame
/// is an error.
async fn next_frame(
    stream: &mut dyn FrameStream,
    session: &Session,
    read_wait: Option<Duration>,
) -> std::result::Result<Frame, ConnectionError> {
    let next = match read_wait {
        None => stream.next_frame().await,
        Some(wait) => timeout_at(session.last_pong() + wait, stream.next_frame())
            .await
            .map_err(|_| ConnectionError::ReadTimeout)?,
    };

    next.unwrap_or_else(|| {
        Err(ConnectionError::Closed {
            status: CloseStatus::AbnormalClosure,
            reason: "connection ended without a close frame".to_string(),
        })
    })
}
