use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::HubError;
use crate::websocket::{CloseStatus, Session};

pub type SessionHandler = Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(Arc<Session>, String) -> BoxFuture<'static, ()> + Send + Sync>;
pub type BinaryHandler = Arc<dyn Fn(Arc<Session>, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(Arc<Session>, HubError) -> BoxFuture<'static, ()> + Send + Sync>;
pub type CloseHandler =
    Arc<dyn Fn(Arc<Session>, CloseStatus, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// One optional callback per lifecycle event. Empty slots are skipped.
#[derive(Clone, Default)]
pub struct Handlers {
    pub(crate) connect: Option<SessionHandler>,
    pub(crate) message: Option<MessageHandler>,
    pub(crate) message_binary: Option<BinaryHandler>,
    pub(crate) error: Option<ErrorHandler>,
    pub(crate) close: Option<CloseHandler>,
    pub(crate) disconnect: Option<SessionHandler>,
    pub(crate) pong: Option<SessionHandler>,
}

impl Handlers {
    pub(crate) async fn on_connect(&self, session: &Arc<Session>) {
        if let Some(handler) = &self.connect {
            handler(session.clone()).await;
        }
    }

    pub(crate) async fn on_message(&self, session: &Arc<Session>, msg: String) {
        if let Some(handler) = &self.message {
            handler(session.clone(), msg).await;
        }
    }

    pub(crate) async fn on_message_binary(&self, session: &Arc<Session>, msg: Vec<u8>) {
        if let Some(handler) = &self.message_binary {
            handler(session.clone(), msg).await;
        }
    }

    pub(crate) async fn on_error(&self, session: &Arc<Session>, err: HubError) {
        if let Some(handler) = &self.error {
            handler(session.clone(), err).await;
        }
    }

    pub(crate) async fn on_close(&self, session: &Arc<Session>, status: CloseStatus, reason: &str) {
        if let Some(handler) = &self.close {
            handler(session.clone(), status, reason.to_string()).await;
        }
    }

    pub(crate) async fn on_disconnect(&self, session: &Arc<Session>) {
        if let Some(handler) = &self.disconnect {
            handler(session.clone()).await;
        }
    }

    pub(crate) async fn on_pong(&self, session: &Arc<Session>) {
        if let Some(handler) = &self.pong {
            handler(session.clone()).await;
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("connect", &self.connect.is_some())
            .field("message", &self.message.is_some())
            .field("message_binary", &self.message_binary.is_some())
            .field("error", &self.error.is_some())
            .field("close", &self.close.is_some())
            .field("disconnect", &self.disconnect.is_some())
            .field("pong", &self.pong.is_some())
            .finish()
    }
}
