//! In-memory connections and callback recorders for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ConnectionError, HubError};
use crate::websocket::transport::{Connection, Frame, FrameSink, FrameStream, RequestInfo};
use crate::websocket::{CloseStatus, Engine, Session};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct ChannelSink(mpsc::UnboundedSender<Frame>);

struct ChannelStream(mpsc::UnboundedReceiver<Result<Frame, ConnectionError>>);

struct StalledSink;

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        self.0
            .send(frame)
            .map_err(|_| ConnectionError::Transport("peer went away".into()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

#[async_trait]
impl FrameStream for ChannelStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, ConnectionError>> {
        self.0.recv().await
    }
}

#[async_trait]
impl FrameSink for StalledSink {
    async fn send_frame(&mut self, _frame: Frame) -> Result<(), ConnectionError> {
        futures::future::pending().await
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// The client end of an in-memory connection.
pub struct Peer {
    pub outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<Result<Frame, ConnectionError>>,
}

impl Peer {
    /// Next frame written by the server, or `None` after a short wait.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn send(&self, frame: Frame) {
        let _ = self.inbound.send(Ok(frame));
    }

    pub fn fail(&self, err: ConnectionError) {
        let _ = self.inbound.send(Err(err));
    }
}

fn channel_pair() -> (ChannelSink, ChannelStream, Peer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let peer = Peer {
        outbound: out_rx,
        inbound: in_tx,
    };
    (ChannelSink(out_tx), ChannelStream(in_rx), peer)
}

pub fn channel_connection() -> (Connection, Peer) {
    let (sink, stream, peer) = channel_pair();
    let connection = Connection::new(sink, stream).with_request(RequestInfo::new("/ws"));
    (connection, peer)
}

/// A session bound to `engine` but not registered with it.
pub fn channel_session(engine: &Engine) -> (Arc<Session>, Peer) {
    let (sink, _stream, peer) = channel_pair();
    let session = Session::new(engine.inner(), Box::new(sink), RequestInfo::new("/ws"));
    (session, peer)
}

/// A session whose writes never complete.
pub fn stalled_session(engine: &Engine) -> Arc<Session> {
    Session::new(engine.inner(), Box::new(StalledSink), RequestInfo::new("/ws"))
}

#[derive(Default)]
struct Recorded {
    connects: usize,
    closes: Vec<(CloseStatus, String)>,
    disconnects: usize,
    errors: Vec<HubError>,
    pongs: usize,
}

/// Records lifecycle callbacks fired by an engine.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Recorded>>);

impl Recorder {
    pub fn attach(engine: &Engine) -> Self {
        let recorder = Self::default();

        let r = recorder.clone();
        engine.handle_connect(move |_| {
            r.0.lock().unwrap().connects += 1;
            async {}
        });
        let r = recorder.clone();
        engine.handle_close(move |_, status, reason| {
            r.0.lock().unwrap().closes.push((status, reason));
            async {}
        });
        let r = recorder.clone();
        engine.handle_disconnect(move |_| {
            r.0.lock().unwrap().disconnects += 1;
            async {}
        });
        let r = recorder.clone();
        engine.handle_error(move |_, err| {
            r.0.lock().unwrap().errors.push(err);
            async {}
        });
        let r = recorder.clone();
        engine.handle_pong(move |_| {
            r.0.lock().unwrap().pongs += 1;
            async {}
        });

        recorder
    }

    pub fn connects(&self) -> usize {
        self.0.lock().unwrap().connects
    }

    pub fn closes(&self) -> Vec<(CloseStatus, String)> {
        self.0.lock().unwrap().closes.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.0.lock().unwrap().disconnects
    }

    pub fn errors(&self) -> Vec<HubError> {
        self.0.lock().unwrap().errors.clone()
    }

    pub fn pongs(&self) -> usize {
        self.0.lock().unwrap().pongs
    }
}
