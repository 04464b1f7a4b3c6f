use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::HubError;
use crate::websocket::transport::Frame;
use crate::websocket::{CloseStatus, Session};
use crate::Result;

/// Ordered registry of live sessions. A session appears at most once,
/// compared by id.
#[derive(Debug, Default)]
pub struct Bucket {
    sessions: RwLock<Vec<Arc<Session>>>,
}

impl Bucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, session: Arc<Session>) -> Result<()> {
        let id = session.id();
        let mut sessions = self.sessions.write().await;
        if sessions.iter().any(|s| s.id() == id) {
            return Err(HubError::DuplicatedSession);
        }
        sessions.push(session);
        info!("Added session {} to bucket", id);
        Ok(())
    }

    pub async fn delete(&self, session: &Session) -> Result<()> {
        let id = session.id();
        let mut sessions = self.sessions.write().await;
        match sessions.iter().position(|s| s.id() == id) {
            Some(index) => {
                sessions.remove(index);
                info!("Removed session {} from bucket", id);
                Ok(())
            }
            None => Err(HubError::SessionNotFound),
        }
    }

    pub async fn contains(&self, session: &Session) -> bool {
        let id = session.id();
        self.sessions.read().await.iter().any(|s| s.id() == id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of the current members, in insertion order.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.clone()
    }

    pub async fn write(&self, msg: &str) -> usize {
        self.broadcast(Frame::Text(msg.to_string()), |_| true).await
    }

    pub async fn write_filter<F>(&self, msg: &str, filter: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        self.broadcast(Frame::Text(msg.to_string()), filter).await
    }

    pub async fn write_others(&self, msg: &str, excluded: &Session) -> usize {
        let excluded = excluded.id();
        self.broadcast(Frame::Text(msg.to_string()), |s| s.id() != excluded)
            .await
    }

    pub async fn write_binary(&self, msg: &[u8]) -> usize {
        self.broadcast(Frame::Binary(msg.to_vec()), |_| true).await
    }

    pub async fn write_binary_filter<F>(&self, msg: &[u8], filter: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        self.broadcast(Frame::Binary(msg.to_vec()), filter).await
    }

    pub async fn write_binary_others(&self, msg: &[u8], excluded: &Session) -> usize {
        let excluded = excluded.id();
        self.broadcast(Frame::Binary(msg.to_vec()), |s| s.id() != excluded)
            .await
    }

    /// Sends `frame` to every member accepted by `filter`. A failing member
    /// does not stop delivery to the others. Returns the number of members
    /// the frame was delivered to.
    async fn broadcast<F>(&self, frame: Frame, filter: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let targets: Vec<_> = self
            .sessions()
            .await
            .into_iter()
            .filter(|s| filter(s.as_ref()))
            .collect();

        let results = join_all(targets.iter().map(|s| s.send(frame.clone()))).await;

        let mut delivered = 0;
        for (session, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Failed to broadcast to session {}: {}", session.id(), e),
            }
        }
        delivered
    }

    /// Closes every current member. Members leave the bucket as part of
    /// their own close handshake.
    pub async fn close(&self, status: CloseStatus) {
        let sessions = self.sessions().await;
        join_all(sessions.iter().map(|s| s.close(status))).await;
    }
}
