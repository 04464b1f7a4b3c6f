use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::HubError;
use crate::websocket::engine::EngineInner;
use crate::websocket::transport::{CloseFrame, Frame, FrameSink, RequestInfo};
use crate::websocket::{CloseStatus, Engine};
use crate::Result;

/// Value kept in a session's store.
pub type Value = Arc<dyn Any + Send + Sync>;

/// State of one accepted connection.
pub struct Session {
    id: Uuid,
    request: RequestInfo,
    connected_at: DateTime<Utc>,
    store: RwLock<HashMap<String, Value>>,
    writer: AsyncMutex<Option<Box<dyn FrameSink>>>,
    closed: watch::Sender<bool>,
    last_pong: Mutex<Instant>,
    config: Arc<EngineConfig>,
    engine: Weak<EngineInner>,
}

impl Session {
    pub(crate) fn new(
        engine: &Arc<EngineInner>,
        sink: Box<dyn FrameSink>,
        request: RequestInfo,
    ) -> Arc<Self> {
        Arc::new(Self::build(engine, Some(sink), request, false))
    }

    /// A session that never got a connection, used to report upgrade
    /// failures with session context. Starts closed and is never registered.
    pub(crate) fn detached(engine: &Arc<EngineInner>, request: RequestInfo) -> Arc<Self> {
        Arc::new(Self::build(engine, None, request, true))
    }

    fn build(
        engine: &Arc<EngineInner>,
        sink: Option<Box<dyn FrameSink>>,
        request: RequestInfo,
        closed: bool,
    ) -> Self {
        let (closed, _) = watch::channel(closed);
        Self {
            id: Uuid::new_v4(),
            request,
            connected_at: Utc::now(),
            store: RwLock::new(HashMap::new()),
            writer: AsyncMutex::new(sink),
            closed,
            last_pong: Mutex::new(Instant::now()),
            config: engine.config.clone(),
            engine: Arc::downgrade(engine),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// The engine this session belongs to, if it is still alive.
    pub fn engine(&self) -> Option<Engine> {
        self.engine.upgrade().map(Engine::from_inner)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Typed lookup: `KeyNotFound` on a miss, `TypeMismatch` when the stored
    /// value is not a `T`.
    pub fn get_as<T>(&self, key: &str) -> Result<T>
    where
        T: Any + Clone + Send + Sync,
    {
        let value = self
            .get(key)
            .ok_or_else(|| HubError::KeyNotFound(key.to_string()))?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| HubError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Like [`get`](Self::get) but panics when the key is absent.
    pub fn must_get(&self, key: &str) -> Value {
        match self.get(key) {
            Some(value) => value,
            None => panic!("{}", HubError::KeyNotFound(key.to_string())),
        }
    }

    pub fn set<V>(&self, key: impl Into<String>, value: V) -> Result<()>
    where
        V: Any + Send + Sync,
    {
        if self.is_closed() {
            return Err(HubError::SessionClosed);
        }
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Arc::new(value));
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::SessionClosed);
        }
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| HubError::KeyNotFound(key.to_string()))
    }

    pub fn keys(&self) -> Vec<String> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub async fn write(&self, msg: impl Into<String>) -> Result<()> {
        self.send(Frame::Text(msg.into())).await
    }

    pub async fn write_binary(&self, msg: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Frame::Binary(msg.into())).await
    }

    /// Sends a ping control frame. A missing pong is detected by the
    /// heartbeat, not here.
    pub async fn ping(&self) -> Result<()> {
        self.send(Frame::Ping(Vec::new())).await
    }

    pub async fn pong(&self) -> Result<()> {
        self.send(Frame::Pong(Vec::new())).await
    }

    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::SessionClosed);
        }
        let mut writer = self.writer.lock().await;
        // The close handshake may have won the race while we waited.
        if self.is_closed() {
            return Err(HubError::SessionClosed);
        }
        let sink = writer.as_mut().ok_or(HubError::SessionClosed)?;
        self.send_with_deadline(sink.as_mut(), frame).await
    }

    async fn send_with_deadline(&self, sink: &mut dyn FrameSink, frame: Frame) -> Result<()> {
        let write_wait = self.config.write_wait;
        timeout(write_wait, sink.send_frame(frame))
            .await
            .map_err(|_| HubError::WriteTimeout(write_wait))?
            .map_err(HubError::from)
    }

    pub async fn close(self: &Arc<Self>, status: CloseStatus) -> Result<()> {
        self.close_with_reason(status, "").await
    }

    /// Runs the close handshake. Only the first caller performs it; every
    /// other caller gets `SessionClosed`.
    ///
    /// Order: deregister, send the close frame, close callback (always),
    /// disconnect callback (normal closure only), release the connection.
    /// Returns the first transport error hit on the way.
    pub async fn close_with_reason(self: &Arc<Self>, status: CloseStatus, reason: &str) -> Result<()> {
        if !self.mark_closed() {
            return Err(HubError::SessionClosed);
        }
        info!("Closing session {} with {}", self.id, status);

        let engine = self.engine.upgrade();
        if let Some(engine) = &engine {
            if let Err(e) = engine.sessions.delete(self).await {
                debug!("Session {} was not registered: {}", self.id, e);
            }
        }

        let mut sink = self.writer.lock().await.take();
        let mut result = Ok(());
        if let Some(sink) = sink.as_mut() {
            let frame = Frame::Close(Some(CloseFrame::new(status, reason)));
            if let Err(e) = self.send_with_deadline(sink.as_mut(), frame).await {
                warn!("Failed to send close frame to session {}: {}", self.id, e);
                result = Err(e);
            }
        }

        let handlers = engine.as_ref().map(|e| e.handlers()).unwrap_or_default();
        handlers.on_close(self, status, reason).await;
        if status == CloseStatus::NormalClosure {
            handlers.on_disconnect(self).await;
        }

        if let Some(mut sink) = sink {
            let released = timeout(self.config.write_wait, sink.close())
                .await
                .map_err(|_| HubError::WriteTimeout(self.config.write_wait))
                .and_then(|r| r.map_err(HubError::from));
            if let Err(e) = released {
                debug!("Failed to release connection of session {}: {}", self.id, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }

    /// Reports a non-fatal error to the engine's error callback. A peer close
    /// with `NormalClosure` is expected shutdown and is not reported.
    pub async fn error(self: &Arc<Self>, err: HubError) {
        if err.is_normal_closure() {
            return;
        }
        debug!("Session {} error: {}", self.id, err);
        if let Some(engine) = self.engine.upgrade() {
            engine.handlers().on_error(self, err).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this cannot fail while we wait.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Open -> closed, exactly once. Returns true for the caller that won.
    fn mark_closed(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub(crate) fn touch_pong(&self) {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("path", &self.request.path())
            .field("closed", &self.is_closed())
            .finish()
    }
}
