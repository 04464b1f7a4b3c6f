//! WebSocket hub: engine, sessions and the registry that holds them.
//!
//! The engine upgrades connections, registers one [`Session`] per
//! connection, keeps it alive with ping/pong heartbeats and runs the close
//! handshake. Applications plug in through the callbacks registered on
//! [`Engine`].

mod bucket;
mod engine;
mod handlers;
mod session;
mod status;
pub mod transport;

pub use bucket::Bucket;
pub use engine::Engine;
pub use handlers::Handlers;
pub use session::{Session, Value};
pub use status::CloseStatus;
pub use transport::{upgrade, CloseFrame, Connection, Frame, FrameSink, FrameStream, RequestInfo};
