// THEORY:
// The `connection` module owns the socket to the detection service. It is an
// explicit, constructible object (one per session) rather than a shared global,
// so independent sessions never share state.
//
// Key architectural principles:
// 1.  **Explicit Lifecycle**: `Idle -> Connecting -> Connected`, with
//     `Reconnecting` and `Failed` for the unhappy paths. Exactly one socket is
//     live at a time.
// 2.  **Epochs Instead of Flags**: every connect, install and disconnect bumps an
//     epoch counter. Background work (the reader of an old socket, a pending
//     reconnect timer) remembers the epoch it was started under and silently
//     retires when the epoch has moved on. This is what makes an explicit
//     `disconnect()` immune to the close event that follows it.
// 3.  **Bounded Reconnection**: an unexpected close schedules one attempt after a
//     fixed delay. The counter tracks reconnect attempts, not drops; when the
//     bound's worth of attempts have all failed the manager parks in `Failed`
//     until someone calls `connect()` again. A successful open resets it.
// 4.  **Fan-out**: inbound messages are parsed once and broadcast to any number
//     of subscribers. A malformed payload becomes a `ProtocolError` event; the
//     socket stays up.

use super::transport::{Connector, Link, LinkCommand, LinkEvent};
use crate::error::TransportError;
use crate::protocol::{InboundResult, OutboundFrameMessage};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub const RECONNECT_DELAY: Duration = Duration::from_millis(2000);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// What subscribers observe.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Message(InboundResult),
    ProtocolError(String),
    StateChanged(ConnectionState),
}

/// Outcome of `send`. Sending while not connected is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Dropped,
}

struct Shared {
    state: ConnectionState,
    attempts: u32,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<LinkCommand>>,
}

struct Inner<C> {
    connector: C,
    endpoint: String,
    shared: Mutex<Shared>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Handle to one managed socket. Clones share the same socket.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, endpoint: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                endpoint: endpoint.into(),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Idle,
                    attempts: 0,
                    epoch: 0,
                    outbound: None,
                }),
                events,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Opens the socket. Resolves immediately if already connected.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let epoch = {
            let mut shared = self.inner.lock();
            if shared.state == ConnectionState::Connected {
                return Ok(());
            }
            shared.epoch += 1;
            if let Some(previous) = shared.outbound.take() {
                let _ = previous.send(LinkCommand::Close);
            }
            self.inner.set_state(&mut shared, ConnectionState::Connecting);
            shared.epoch
        };

        info!(endpoint = %self.inner.endpoint, "connecting to detection service");
        match self.inner.connector.open(&self.inner.endpoint).await {
            Ok(link) => {
                let mut shared = self.inner.lock();
                if shared.epoch != epoch {
                    let _ = link.outbound.send(LinkCommand::Close);
                    return Err(TransportError::Superseded);
                }
                self.inner.install(&mut shared, link);
                info!(endpoint = %self.inner.endpoint, "connection established");
                Ok(())
            }
            Err(e) => {
                let mut shared = self.inner.lock();
                if shared.epoch == epoch {
                    warn!(error = %e, "connection failed before open");
                    self.inner.set_state(&mut shared, ConnectionState::Failed);
                }
                Err(e)
            }
        }
    }

    /// Closes the socket on purpose. Never triggers reconnection.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock();
        shared.epoch += 1;
        if let Some(outbound) = shared.outbound.take() {
            let _ = outbound.send(LinkCommand::Close);
            info!("connection closed by client");
        }
        self.inner.set_state(&mut shared, ConnectionState::Idle);
    }

    pub fn send(&self, message: &OutboundFrameMessage) -> SendStatus {
        let shared = self.inner.lock();
        if let (ConnectionState::Connected, Some(outbound)) = (shared.state, shared.outbound.as_ref()) {
            if outbound.send(LinkCommand::Text(message.to_json())).is_ok() {
                return SendStatus::Sent;
            }
        }
        SendStatus::Dropped
    }
}

impl<C: Connector> Inner<C> {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, shared: &mut Shared, next: ConnectionState) {
        if shared.state != next {
            debug!(from = ?shared.state, to = ?next, "connection state changed");
            shared.state = next;
            let _ = self.events.send(ConnectionEvent::StateChanged(next));
        }
    }

    /// Adopts a freshly opened link as the active socket.
    fn install(self: &Arc<Self>, shared: &mut Shared, link: Link) {
        shared.epoch += 1;
        shared.attempts = 0;
        shared.outbound = Some(link.outbound);
        self.set_state(shared, ConnectionState::Connected);

        let epoch = shared.epoch;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.read_loop(epoch, link.inbound).await });
    }

    async fn read_loop(self: Arc<Self>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<LinkEvent>) {
        let reason = loop {
            match inbound.recv().await {
                Some(LinkEvent::Text(text)) => {
                    if self.lock().epoch != epoch {
                        return;
                    }
                    self.dispatch(&text);
                }
                Some(LinkEvent::Closed(reason)) => break reason,
                None => break None,
            }
        };
        self.handle_close(epoch, reason);
    }

    fn dispatch(&self, text: &str) {
        match InboundResult::parse(text) {
            Ok(result) => {
                let _ = self.events.send(ConnectionEvent::Message(result));
            }
            Err(e) => {
                warn!(error = %e, "error parsing inbound message");
                let _ = self.events.send(ConnectionEvent::ProtocolError(e.to_string()));
            }
        }
    }

    fn handle_close(self: &Arc<Self>, epoch: u64, reason: Option<String>) {
        let mut shared = self.lock();
        if shared.epoch != epoch || shared.state != ConnectionState::Connected {
            debug!("ignoring close of a retired socket");
            return;
        }
        shared.outbound = None;
        warn!(reason = reason.as_deref().unwrap_or("none"), "connection lost unexpectedly");

        if self.note_failure(&mut shared) {
            let this = Arc::clone(self);
            let epoch = shared.epoch;
            tokio::spawn(async move { this.reconnect(epoch).await });
        }
    }

    /// Schedules the next attempt unless the budget is spent. Returns whether one was scheduled.
    fn note_failure(&self, shared: &mut Shared) -> bool {
        if shared.attempts >= MAX_RECONNECT_ATTEMPTS {
            warn!(attempts = shared.attempts, "reconnect attempts exhausted");
            self.set_state(shared, ConnectionState::Failed);
            return false;
        }
        shared.attempts += 1;
        info!(
            "attempting to reconnect ({}/{}) in {:?}",
            shared.attempts, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY
        );
        self.set_state(shared, ConnectionState::Reconnecting);
        true
    }

    async fn reconnect(self: Arc<Self>, epoch: u64) {
        loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            {
                let mut shared = self.lock();
                if shared.epoch != epoch || shared.state != ConnectionState::Reconnecting {
                    return;
                }
                self.set_state(&mut shared, ConnectionState::Connecting);
            }

            let opened = self.connector.open(&self.endpoint).await;
            {
                let mut shared = self.lock();
                if shared.epoch != epoch || shared.state != ConnectionState::Connecting {
                    if let Ok(link) = opened {
                        let _ = link.outbound.send(LinkCommand::Close);
                    }
                    return;
                }
                match opened {
                    Ok(link) => {
                        info!("reconnected to detection service");
                        self.install(&mut shared, link);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "reconnect attempt failed");
                        if !self.note_failure(&mut shared) {
                            return;
                        }
                    }
                }
            }
        }
    }
}
