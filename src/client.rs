use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::channel::{SubscriptionState, validate_client_event};
use crate::config::ClientConfig;
use crate::connection::{ConnectionState, Connector, WebSocketConnector};
use crate::engine::{Command, Engine, Query};
use crate::error::ReverbError;
use crate::event::{BindingId, ChannelEvent};
use crate::presence::Members;

/// Main client for connecting to a Laravel Reverb (or any Pusher-protocol)
/// server.
///
/// The client is a cheap handle: clones share one connection. All state
/// lives in a background task spawned by [`ReverbClient::new`], so the client
/// must be created inside a tokio runtime. The task stops once every handle
/// has been dropped, and that includes clones captured by bound callbacks:
/// such a callback keeps the task alive until it is unbound.
#[derive(Clone)]
pub struct ReverbClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    next_binding: Arc<AtomicU64>,
}

impl ReverbClient {
    /// Create a client that talks WebSocket to the configured server.
    pub fn new(config: ClientConfig) -> Result<Self, ReverbError> {
        Self::with_connector(config, WebSocketConnector)
    }

    /// Create a client on top of a custom transport.
    pub fn with_connector<C: Connector + 'static>(
        config: ClientConfig,
        connector: C,
    ) -> Result<Self, ReverbError> {
        let url = config.socket_url()?;
        debug!("Creating client for {}", url);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let engine = Engine::new(config, Arc::new(connector), commands_rx, state_tx);
        tokio::spawn(engine.run());

        Ok(Self {
            commands,
            state,
            next_binding: Arc::new(AtomicU64::new(1)),
        })
    }

    fn send(&self, command: Command) -> Result<(), ReverbError> {
        self.commands
            .send(command)
            .map_err(|_| ReverbError::ConnectionError("client has shut down".to_string()))
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Query) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Query(build(tx))).ok()?;
        rx.await.ok()
    }

    /// Start connecting. Returns immediately; watch [`state`](Self::state)
    /// or bind `state_change` to follow progress. Calling this while
    /// connecting or connected does nothing.
    pub fn connect(&self) -> Result<(), ReverbError> {
        self.send(Command::Connect)
    }

    /// Close the connection and stop reconnecting. Channels are kept and
    /// resubscribed on the next [`connect`](Self::connect).
    pub fn disconnect(&self) -> Result<(), ReverbError> {
        self.send(Command::Disconnect)
    }

    /// Subscribe to a channel. Private and presence channels are authorized
    /// first. If not connected yet the subscription waits for the connection.
    pub fn subscribe(&self, channel: &str) -> Result<(), ReverbError> {
        self.subscribe_with(channel, false)
    }

    /// Like [`subscribe`](Self::subscribe); with `force` a subscribed or
    /// failed channel is subscribed again.
    pub fn subscribe_with(&self, channel: &str, force: bool) -> Result<(), ReverbError> {
        self.send(Command::Subscribe {
            channel: channel.to_string(),
            force,
        })
    }

    /// Unsubscribe and forget the channel, including its bindings.
    pub fn unsubscribe(&self, channel: &str) -> Result<(), ReverbError> {
        self.send(Command::Unsubscribe {
            channel: channel.to_string(),
        })
    }

    /// Bind a callback to `event`, on one channel or (with `None`) on every
    /// channel and the connection itself.
    ///
    /// Callbacks run on the client's task and must not block.
    pub fn bind<F>(&self, channel: Option<&str>, event: &str, callback: F) -> BindingId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.register(channel, Some(event), Arc::new(callback))
    }

    /// Bind a callback to every event on a channel, or everywhere.
    pub fn bind_all<F>(&self, channel: Option<&str>, callback: F) -> BindingId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.register(channel, None, Arc::new(callback))
    }

    fn register(
        &self,
        channel: Option<&str>,
        event: Option<&str>,
        callback: crate::event::Callback,
    ) -> BindingId {
        let id = BindingId(self.next_binding.fetch_add(1, Ordering::Relaxed));
        let command = Command::Bind {
            channel: channel.map(str::to_string),
            event: event.map(str::to_string),
            id,
            callback,
        };
        if let Err(e) = self.send(command) {
            warn!("Binding dropped: {}", e);
        }
        id
    }

    /// Remove the callback `id` from `event`, or every callback for `event`
    /// when `id` is `None`.
    pub fn unbind(
        &self,
        channel: Option<&str>,
        event: &str,
        id: Option<BindingId>,
    ) -> Result<(), ReverbError> {
        self.send(Command::Unbind {
            channel: channel.map(str::to_string),
            event: Some(event.to_string()),
            id,
        })
    }

    /// Remove the catch-all callback `id`, or every catch-all when `None`.
    pub fn unbind_all(&self, channel: Option<&str>, id: Option<BindingId>) -> Result<(), ReverbError> {
        self.send(Command::Unbind {
            channel: channel.map(str::to_string),
            event: None,
            id,
        })
    }

    /// Send a client event to the other subscribers of a private or presence
    /// channel. The `client-` prefix is added when missing.
    ///
    /// Fails without touching the network on public channels or reserved
    /// event names, and when the channel is not subscribed.
    pub async fn trigger(&self, channel: &str, event: &str, data: Value) -> Result<(), ReverbError> {
        validate_client_event(channel, event)?;

        let (reply, rx) = oneshot::channel();
        self.send(Command::Trigger {
            channel: channel.to_string(),
            event: event.to_string(),
            data,
            reply,
        })?;
        rx.await
            .map_err(|_| ReverbError::ConnectionError("client has shut down".to_string()))?
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ReverbError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| ReverbError::ConnectionError("client has shut down".to_string()))
    }

    /// Socket id assigned by the server; `None` unless connected.
    pub async fn socket_id(&self) -> Option<String> {
        self.query(Query::SocketId).await.flatten()
    }

    /// State of a channel, or `None` for a channel the client does not know.
    pub async fn channel_state(&self, channel: &str) -> Option<SubscriptionState> {
        self.query(|reply| Query::ChannelState {
            channel: channel.to_string(),
            reply,
        })
        .await
        .flatten()
    }

    /// Last subscriber count the server reported for the channel.
    pub async fn subscription_count(&self, channel: &str) -> Option<u64> {
        self.query(|reply| Query::SubscriptionCount {
            channel: channel.to_string(),
            reply,
        })
        .await
        .flatten()
    }

    /// Snapshot of a subscribed presence channel's roster.
    pub async fn members(&self, channel: &str) -> Option<Members> {
        self.query(|reply| Query::Members {
            channel: channel.to_string(),
            reply,
        })
        .await
        .flatten()
    }
}

impl std::fmt::Debug for ReverbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverbClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
