use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wshub::{CloseStatus, Engine, Settings};

/// Chat room: every text message is relayed to all connected sessions.
fn chat_engine(engine: &Engine) {
    engine.handle_connect(|session| async move {
        info!(
            "{} joined from {}",
            session.id(),
            session.request().header("x-forwarded-for").unwrap_or("unknown")
        );
    });

    engine.handle_message(|session, msg| async move {
        // The session only holds a weak reference; None during shutdown.
        if let Some(engine) = session.engine() {
            let delivered = engine.write(&msg).await;
            info!("Relayed message from {} to {} sessions", session.id(), delivered);
        }
    });

    engine.handle_error(|session, err| async move {
        warn!("Session {} error: {}", session.id(), err);
    });

    engine.handle_close(|session, status: CloseStatus, reason| async move {
        info!("{} left with {} {}", session.id(), status, reason);
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    // Load configuration
    let settings = Settings::new().context("Failed to load configuration")?;
    info!("Configuration loaded successfully ({})", settings.environment);

    let engine = Engine::try_new(settings.engine_config()?)?;
    chat_engine(&engine);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("WebSocket hub listening at ws://{}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.handle_request(stream).await {
                        warn!("Connection from {} ended with error: {}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    engine.close().await;
    Ok(())
}
