pub mod config;
pub mod error;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{EngineConfig, Settings, UpgraderConfig};
pub use error::{ConnectionError, HubError};
pub use websocket::{
    Bucket, CloseFrame, CloseStatus, Connection, Engine, Frame, FrameSink, FrameStream,
    RequestInfo, Session, Value,
};

pub type Result<T> = std::result::Result<T, HubError>;
