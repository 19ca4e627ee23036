// THEORY:
// The `transport` module is the seam between the connection manager's state
// machine and an actual socket. A `Connector` opens a `Link`, which is nothing
// more than a pair of channels: commands flow out, events flow in. The manager
// never touches a socket type directly, which keeps its lifecycle logic testable
// with in-memory links and keeps the tungstenite details in one place.

use crate::error::TransportError;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Instructions for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Text(String),
    Close,
}

/// Everything a socket can report after it has opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    /// The socket is gone. Carries the close reason or transport error, if any.
    Closed(Option<String>),
}

/// An open socket, expressed as channels.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<LinkCommand>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens sockets to the detection service.
///
/// `open` resolves once the transport has confirmed the connection and fails if
/// an error occurs before that point.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, endpoint: &str) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<Link, TransportError> {
        let (socket, _response) =
            tokio_tungstenite::connect_async(endpoint)
                .await
                .map_err(|e| TransportError::Open {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(endpoint, "websocket handshake complete");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut commands) = mpsc::unbounded_channel::<LinkCommand>();
        let (events, inbound) = mpsc::unbounded_channel::<LinkEvent>();

        // Writer: drains commands until Close or until every sender is dropped.
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    LinkCommand::Text(text) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            warn!(error = %e, "websocket send failed");
                            break;
                        }
                    }
                    LinkCommand::Close => break,
                }
            }
            let _ = sink.close().await;
        });

        // Reader: forwards text frames, reports the first close or error.
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(LinkEvent::Text(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = events.send(LinkEvent::Closed(reason));
        });

        Ok(Link { outbound, inbound })
    }
}
