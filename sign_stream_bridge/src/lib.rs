// THEORY:
// The bridge is the presentation side of a `StreamSession`. It knows nothing
// about sockets to the detection service or cameras; it only relays what the
// session publishes and turns user intents into session calls.
//
// - `EventBus` fans `SessionEvent`s out to any number of viewers.
// - `ControlHandle` carries user intents as watch channels: a streaming flag
//   (start/stop) and the current `StreamSettings`. Watch semantics mean a slow
//   session only ever sees the latest intent.
// - `follow_controls` is the loop that owns a session and applies those intents.
// - `start_server` (feature `web`) exposes the bus over a WebSocket and the
//   controls over plain HTTP.

use sign_stream::{CameraBackend, Connector, SessionEvent, StreamSession, StreamSettings};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone)]
pub struct EventBus {
    pub events_tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel::<SessionEvent>(capacity.max(1));
        Self { events_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Copies every event from `source` onto the bus until `source` closes.
    pub fn relay(&self, mut source: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        let _ = events_tx.send(event);
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event relay fell behind"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ControlHandle {
    pub streaming_tx: watch::Sender<bool>,
    pub settings_tx: watch::Sender<StreamSettings>,
}

impl ControlHandle {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            streaming_tx: watch::Sender::new(false),
            settings_tx: watch::Sender::new(settings),
        }
    }
}

/// Drives `session` from `control` until every clone of the handle is dropped.
///
/// The current streaming flag is honored on entry, so an intent sent before
/// this loop started is not lost. The session is stopped on exit.
pub async fn follow_controls<C, B>(mut session: StreamSession<C, B>, bus: &EventBus, control: ControlHandle)
where
    C: Connector,
    B: CameraBackend,
{
    let relay = bus.relay(session.events());
    let mut streaming = control.streaming_tx.subscribe();
    let mut settings = control.settings_tx.subscribe();
    drop(control);

    session.update_settings(*settings.borrow_and_update());
    let mut wanted = *streaming.borrow_and_update();

    loop {
        if wanted && !session.is_streaming() {
            if let Err(e) = session.start().await {
                warn!(error = %e, "stream could not start");
            }
        } else if !wanted && session.is_streaming() {
            session.stop().await;
        }

        tokio::select! {
            changed = streaming.changed() => {
                if changed.is_err() {
                    break;
                }
                wanted = *streaming.borrow_and_update();
            }
            changed = settings.changed() => {
                if changed.is_err() {
                    break;
                }
                session.update_settings(*settings.borrow_and_update());
            }
        }
    }

    session.stop().await;
    drop(session);
    // The relay ends on its own once the session's sender is gone.
    let _ = relay.await;
    info!("control handle dropped, session finished");
}

#[cfg(feature = "web")]
pub async fn start_server(bus: EventBus, cfg: ServerConfig, control: ControlHandle) -> anyhow::Result<JoinHandle<()>> {
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures_util::{SinkExt, StreamExt};
    use serde::Deserialize;
    use sign_stream::FrameRate;

    #[derive(Debug, Deserialize)]
    struct FrameRateRequest {
        fps: u32,
    }

    async fn stream_events(socket: WebSocket, bus: EventBus) {
        let mut events = bus.subscribe();
        let (mut ws_tx, mut ws_rx) = socket.split();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/ws/events", get({
            let bus = bus.clone();
            move |ws: WebSocketUpgrade| {
                let bus = bus.clone();
                async move { ws.on_upgrade(move |socket| stream_events(socket, bus)) }
            }
        }))
        .route("/control/start", post({
            let tx = control.streaming_tx.clone();
            move || {
                let tx = tx.clone();
                async move { tx.send_replace(true); StatusCode::NO_CONTENT }
            }
        }))
        .route("/control/stop", post({
            let tx = control.streaming_tx.clone();
            move || {
                let tx = tx.clone();
                async move { tx.send_replace(false); StatusCode::NO_CONTENT }
            }
        }))
        .route("/control/frame-rate", post({
            let tx = control.settings_tx.clone();
            move |Json(request): Json<FrameRateRequest>| {
                let tx = tx.clone();
                async move {
                    match FrameRate::new(request.fps) {
                        Ok(frame_rate) => {
                            tx.send_modify(|settings| settings.frame_rate = frame_rate);
                            (StatusCode::NO_CONTENT, String::new())
                        }
                        Err(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
                    }
                }
            }
        }));

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    info!(addr = %cfg.bind_addr, "bridge server listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "bridge server stopped");
        }
    });

    Ok(server)
}

#[cfg(not(feature = "web"))]
pub async fn start_server(_bus: EventBus, _cfg: ServerConfig, _control: ControlHandle) -> anyhow::Result<JoinHandle<()>> {
    Err(anyhow::anyhow!("web feature not enabled for sign_stream_bridge"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sign_stream::core_modules::transport::{Link, LinkCommand, LinkEvent};
    use sign_stream::error::TransportError;
    use sign_stream::{ConnectionState, FrameRate, SessionConfig, TestPatternBackend};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    type ServerEnd = (mpsc::UnboundedSender<LinkEvent>, mpsc::UnboundedReceiver<LinkCommand>);

    /// Always opens; keeps the service side of every link alive.
    #[derive(Clone, Default)]
    struct LoopbackConnector {
        servers: Arc<Mutex<Vec<ServerEnd>>>,
    }

    impl Connector for LoopbackConnector {
        async fn open(&self, _endpoint: &str) -> Result<Link, TransportError> {
            let (outbound, from_client) = mpsc::unbounded_channel();
            let (to_client, inbound) = mpsc::unbounded_channel();
            self.servers.lock().unwrap().push((to_client, from_client));
            Ok(Link { outbound, inbound })
        }
    }

    fn session(connector: LoopbackConnector) -> StreamSession<LoopbackConnector, TestPatternBackend> {
        let mut config = SessionConfig::default();
        config.constraints.ideal_width = 16;
        config.constraints.ideal_height = 16;
        StreamSession::new(&config, connector, TestPatternBackend::new())
    }

    async fn next_connection_state(rx: &mut broadcast::Receiver<SessionEvent>) -> ConnectionState {
        loop {
            if let SessionEvent::Connection(state) = rx.recv().await.unwrap() {
                return state;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_intents_drive_the_session() {
        let connector = LoopbackConnector::default();
        let bus = EventBus::new(64);
        let mut events = bus.subscribe();
        let control = ControlHandle::new(StreamSettings::default());

        let driver = {
            let bus = bus.clone();
            let control = control.clone();
            let session = session(connector.clone());
            tokio::spawn(async move { follow_controls(session, &bus, control).await })
        };

        control.streaming_tx.send_replace(true);
        assert_eq!(next_connection_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_connection_state(&mut events).await, ConnectionState::Connected);

        control.streaming_tx.send_replace(false);
        assert_eq!(next_connection_state(&mut events).await, ConnectionState::Idle);

        drop(control);
        driver.await.unwrap();
        assert_eq!(connector.servers.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn frame_rate_intent_reaches_the_scheduler() {
        let connector = LoopbackConnector::default();
        let bus = EventBus::new(64);
        let control = ControlHandle::new(StreamSettings::default());
        control.streaming_tx.send_replace(true);

        let driver = {
            let bus = bus.clone();
            let control = control.clone();
            let session = session(connector.clone());
            tokio::spawn(async move { follow_controls(session, &bus, control).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        control
            .settings_tx
            .send_modify(|settings| settings.frame_rate = FrameRate::new(25).unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(205)).await;

        let sent = {
            let mut servers = connector.servers.lock().unwrap();
            let (_, from_client) = &mut servers[0];
            let mut frames = 0;
            while let Ok(LinkCommand::Text(_)) = from_client.try_recv() {
                frames += 1;
            }
            frames
        };
        assert_eq!(sent, 5);

        drop(control);
        driver.await.unwrap();
    }
}
