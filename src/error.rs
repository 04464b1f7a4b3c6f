use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::websocket::CloseStatus;

#[derive(Error, Debug, Clone)]
pub enum HubError {
    #[error("Engine is closed, refusing to upgrade connection")]
    EngineClosed,

    #[error("Session is already closed")]
    SessionClosed,

    #[error("Session is already in the bucket")]
    DuplicatedSession,

    #[error("Session not found in the bucket")]
    SessionNotFound,

    #[error("Key not found in session store: {0}")]
    KeyNotFound(String),

    #[error("Value stored under {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Transport-level failures. Not subdivided further than the read loop needs
/// to pick a close status.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Peer closed the connection ({status}): {reason}")]
    Closed { status: CloseStatus, reason: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("No frame received before the read deadline")]
    ReadTimeout,

    #[error("No pong received before the heartbeat timeout")]
    PongTimeout,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl HubError {
    /// True for a peer close carrying `NormalClosure`, which is expected
    /// shutdown and never reported to the error callback.
    pub fn is_normal_closure(&self) -> bool {
        matches!(
            self,
            HubError::Connection(ConnectionError::Closed {
                status: CloseStatus::NormalClosure,
                ..
            })
        )
    }
}

impl From<tungstenite::Error> for ConnectionError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                ConnectionError::Closed {
                    status: CloseStatus::AbnormalClosure,
                    reason: err.to_string(),
                }
            }
            _ => ConnectionError::Transport(err.to_string()),
        }
    }
}

impl From<tungstenite::Error> for HubError {
    fn from(err: tungstenite::Error) -> Self {
        HubError::Connection(err.into())
    }
}

impl From<config::ConfigError> for HubError {
    fn from(err: config::ConfigError) -> Self {
        HubError::Config(err.to_string())
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Connection(ConnectionError::Transport(err.to_string()))
    }
}
