use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use wshub::{CloseStatus, Engine, HubError};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Event {
    Connect,
    Close(CloseStatus, String),
    Disconnect,
    Error,
}

async fn start_hub(engine: Engine) -> Url {
    let _ = tracing_subscriber::fmt::try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = engine.handle_request(stream).await;
            });
        }
    });

    Url::parse(&format!("ws://{}/ws?room=lobby", addr)).unwrap()
}

fn record_events(engine: &Engine) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();

    let events = tx.clone();
    engine.handle_connect(move |_| {
        let _ = events.send(Event::Connect);
        async {}
    });
    let events = tx.clone();
    engine.handle_close(move |_, status, reason| {
        let _ = events.send(Event::Close(status, reason));
        async {}
    });
    let events = tx.clone();
    engine.handle_disconnect(move |_| {
        let _ = events.send(Event::Disconnect);
        async {}
    });
    engine.handle_error(move |_, _| {
        let _ = tx.send(Event::Error);
        async {}
    });

    rx
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, events.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Event channel closed")
}

async fn next_text<S>(ws: &mut S) -> String
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(WAIT, ws.next()).await.expect("Timed out waiting for message") {
            Some(Ok(Message::Text(text))) => return text,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_echo() {
    let engine = Engine::with_defaults();
    engine.handle_message(|session, msg| async move {
        session.write(format!("{}, world", msg)).await.unwrap();
    });
    let url = start_hub(engine).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Text("Hello".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "Hello, world");

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    ws.send(Message::Text("Again".into())).await.unwrap();
    // No binary handler registered, so only the text message comes back.
    assert_eq!(next_text(&mut ws).await, "Again, world");
}

#[tokio::test]
async fn test_request_metadata_is_available() {
    let engine = Engine::with_defaults();
    engine.handle_connect(|session| async move {
        let reply = format!(
            "{} {}",
            session.request().path(),
            session.request().query().unwrap_or_default()
        );
        session.write(reply).await.unwrap();
    });
    let url = start_hub(engine).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "/ws room=lobby");
}

#[tokio::test]
async fn test_broadcast_to_others() {
    let engine = Engine::with_defaults();
    let mut events = record_events(&engine);
    engine.handle_message(|session, msg| async move {
        if let Some(engine) = session.engine() {
            engine.write_others(&msg, &session).await;
        }
    });
    let url = start_hub(engine.clone()).await;

    let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Connect);
    let (mut bob, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Connect);
    let (mut carol, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Connect);
    assert_eq!(engine.len().await, 3);

    alice.send(Message::Text("hi all".into())).await.unwrap();
    assert_eq!(next_text(&mut bob).await, "hi all");
    assert_eq!(next_text(&mut carol).await, "hi all");
    assert!(timeout(Duration::from_millis(200), alice.next()).await.is_err());

    assert_eq!(engine.write("announcement").await, 3);
    assert_eq!(next_text(&mut alice).await, "announcement");
    assert_eq!(next_text(&mut bob).await, "announcement");
    assert_eq!(next_text(&mut carol).await, "announcement");
}

#[tokio::test]
async fn test_cooperative_close() {
    let engine = Engine::with_defaults();
    let mut events = record_events(&engine);
    let url = start_hub(engine.clone()).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Connect);

    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    }))
    .await
    .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        Event::Close(CloseStatus::NormalClosure, "bye".to_string())
    );
    assert_eq!(next_event(&mut events).await, Event::Disconnect);
    assert_eq!(engine.len().await, 0);

    // The server answers with the same status.
    match timeout(WAIT, ws.next()).await.unwrap() {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("Expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dropped_connection_closes_abnormally() {
    let engine = Engine::with_defaults();
    let mut events = record_events(&engine);
    let url = start_hub(engine.clone()).await;

    let (ws, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Connect);
    drop(ws);

    assert_eq!(next_event(&mut events).await, Event::Error);
    match next_event(&mut events).await {
        Event::Close(status, _) => assert_eq!(status, CloseStatus::AbnormalClosure),
        other => panic!("Expected close event, got {:?}", other),
    }
    assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());
    assert_eq!(engine.len().await, 0);
}

#[tokio::test]
async fn test_engine_close() {
    let engine = Engine::with_defaults();
    let mut events = record_events(&engine);
    let url = start_hub(engine.clone()).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Connect);

    engine.close().await;
    assert!(engine.is_closed());

    match timeout(WAIT, ws.next()).await.unwrap() {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("Expected close frame, got {:?}", other),
    }
    assert_eq!(
        next_event(&mut events).await,
        Event::Close(CloseStatus::NormalClosure, String::new())
    );
    assert_eq!(next_event(&mut events).await, Event::Disconnect);
    assert_eq!(engine.len().await, 0);

    // New connections are turned away before the handshake.
    assert!(connect_async(url.as_str()).await.is_err());
    let (client, _server) = tokio::io::duplex(64);
    assert!(matches!(
        engine.handle_request(client).await,
        Err(HubError::EngineClosed)
    ));
}
