use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::ReverbError;

/// Connection state as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Unavailable,
}

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// An open socket: text frames out, transport events in.
///
/// The outgoing queue is unbounded so the client never waits on a slow peer;
/// a peer that stops reading is caught by the pong deadline instead.
/// Dropping the link closes the socket.
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
    _task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TransportLink {
    pub fn new(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            _task_handle: None,
        }
    }

    pub fn send(&self, text: String) -> Result<(), ReverbError> {
        self.outgoing
            .send(text)
            .map_err(|e| ReverbError::SendError(e.to_string()))
    }
}

/// Opens sockets. The default is [`WebSocketConnector`]; tests and custom
/// transports provide their own.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<TransportLink, ReverbError>;
}

/// What to do after the server closes or errors with a Pusher status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// 4000-4099: the application refused the connection; stop.
    Refused,
    /// 4100-4199 and unknown codes: retry after a backoff delay.
    Backoff,
    /// 4200-4299: retry right away.
    Immediate,
}

impl ReconnectPolicy {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(4000..=4099) => ReconnectPolicy::Refused,
            Some(4200..=4299) => ReconnectPolicy::Immediate,
            _ => ReconnectPolicy::Backoff,
        }
    }
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<TransportLink, ReverbError> {
        info!("Connecting to {}", url);

        let (ws_stream, response) = connect_async(url.as_str()).await.map_err(|e| {
            error!("Failed to connect to WebSocket server: {}", e);
            e
        })?;
        debug!("Connected to WebSocket server. Response: {:?}", response.status());

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let last = loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(text) => {
                            trace!("Sending message: {}", text);
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                error!("Error sending message: {}", e);
                                break TransportEvent::Error(e.to_string());
                            }
                        }
                        None => {
                            if let Err(e) = sink.send(Message::Close(None)).await {
                                warn!("Error sending close frame: {}", e);
                            }
                            break TransportEvent::Closed {
                                code: None,
                                reason: "closed by client".to_string(),
                            };
                        }
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            trace!("Received message: {}", text);
                            if events_tx.send(TransportEvent::Message(text)).is_err() {
                                let _ = sink.send(Message::Close(None)).await;
                                return;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                error!("Failed to send pong: {}", e);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                                .unwrap_or((None, String::new()));
                            break TransportEvent::Closed { code, reason };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            break TransportEvent::Error(e.to_string());
                        }
                        None => {
                            break TransportEvent::Closed {
                                code: None,
                                reason: "stream ended".to_string(),
                            };
                        }
                    },
                }
            };
            let _ = events_tx.send(last);
        });

        Ok(TransportLink {
            outgoing: tx,
            incoming: events_rx,
            _task_handle: Some(task),
        })
    }
}
