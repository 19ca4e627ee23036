use sign_stream::{SessionConfig, StillImageBackend, StreamSession, TestPatternBackend, WsConnector};
use sign_stream_bridge::{ControlHandle, EventBus, ServerConfig, follow_controls, start_server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Bind address from env or default
    let bind = std::env::var("SIGN_STREAM_BIND").unwrap_or_else(|_| "127.0.0.1:3001".to_string());
    let config = SessionConfig::from_env();

    let bus = EventBus::new(64);
    let control = ControlHandle::new(config.settings);
    let server = start_server(bus.clone(), ServerConfig { bind_addr: bind }, control.clone()).await?;
    info!(endpoint = %config.endpoint, "waiting for POST /control/start");

    // Still image stands in for a camera when given, otherwise a test pattern.
    match std::env::var("SIGN_STREAM_IMAGE").ok().filter(|path| !path.is_empty()) {
        Some(path) => {
            let session = StreamSession::new(&config, WsConnector, StillImageBackend::new(path));
            follow_controls(session, &bus, control).await;
        }
        None => {
            let session = StreamSession::new(&config, WsConnector, TestPatternBackend::new());
            follow_controls(session, &bus, control).await;
        }
    }

    // Park until the server exits
    server.await.ok();
    Ok(())
}
