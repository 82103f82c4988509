//! The client's event loop.
//!
//! One task owns the connection state, the channel registry and the global
//! bindings. Commands from [`ReverbClient`](crate::ReverbClient) handles,
//! socket events, authorization results and timers are all handled here one
//! at a time, so state transitions never race.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::auth::{AuthRequest, AuthResponse};
use crate::backoff::Backoff;
use crate::channel::{Attempt, ChannelRegistry, SubscriptionState, validate_client_event};
use crate::config::ClientConfig;
use crate::connection::{
    ConnectionState, Connector, ReconnectPolicy, TransportEvent, TransportLink,
};
use crate::error::ReverbError;
use crate::event::{BindingId, Callback, ChannelEvent, EventDispatcher};
use crate::message::{
    self, ConnectionData, ErrorData, Frame, events, id_from_value,
};
use crate::presence::{Member, Members};

pub(crate) enum Command {
    Connect,
    Disconnect,
    Subscribe {
        channel: String,
        force: bool,
    },
    Unsubscribe {
        channel: String,
    },
    Bind {
        channel: Option<String>,
        event: Option<String>,
        id: BindingId,
        callback: Callback,
    },
    Unbind {
        channel: Option<String>,
        event: Option<String>,
        id: Option<BindingId>,
    },
    Trigger {
        channel: String,
        event: String,
        data: Value,
        reply: oneshot::Sender<Result<(), ReverbError>>,
    },
    Query(Query),
}

pub(crate) enum Query {
    SocketId(oneshot::Sender<Option<String>>),
    ChannelState {
        channel: String,
        reply: oneshot::Sender<Option<SubscriptionState>>,
    },
    SubscriptionCount {
        channel: String,
        reply: oneshot::Sender<Option<u64>>,
    },
    Members {
        channel: String,
        reply: oneshot::Sender<Option<Members>>,
    },
}

enum Internal {
    Opened {
        attempt: u64,
        result: Result<TransportLink, ReverbError>,
    },
    Authorized {
        channel: String,
        attempt: u64,
        result: Result<AuthResponse, ReverbError>,
    },
}

pub(crate) struct Engine {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    socket_id: Option<String>,
    link: Option<TransportLink>,
    open_attempt: u64,
    opening: Option<JoinHandle<()>>,
    auto_reconnect: bool,
    /// Set by a `pusher:error` frame, applied when the socket then closes.
    error_policy: Option<ReconnectPolicy>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    activity_timeout: Duration,
    activity_deadline: Option<Instant>,
    pong_deadline: Option<Instant>,
    registry: ChannelRegistry,
    global: EventDispatcher,
    next_attempt: u64,
}

impl Engine {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            backoff: config.backoff(),
            activity_timeout: config.activity_timeout,
            config,
            connector,
            commands,
            internal_tx,
            internal_rx,
            state: ConnectionState::Disconnected,
            state_tx,
            socket_id: None,
            link: None,
            open_attempt: 0,
            opening: None,
            auto_reconnect: false,
            error_policy: None,
            reconnect_at: None,
            activity_deadline: None,
            pong_deadline: None,
            registry: ChannelRegistry::new(),
            global: EventDispatcher::new(),
            next_attempt: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                event = next_transport_event(&mut self.link) => {
                    self.handle_transport_event(event)
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = sleep_until_opt(self.activity_deadline) => self.on_activity_timeout(),
                _ = sleep_until_opt(self.pong_deadline) => self.on_pong_timeout(),
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect();
                }
            }
        }

        self.auto_reconnect = false;
        self.reconnect_at = None;
        self.teardown_link();
        self.set_state(ConnectionState::Disconnected);
        debug!("Client engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Subscribe { channel, force } => self.subscribe(&channel, force),
            Command::Unsubscribe { channel } => self.unsubscribe(&channel),
            Command::Bind {
                channel,
                event,
                id,
                callback,
            } => {
                let listeners = match channel {
                    Some(name) => &mut self.registry.get_or_create(&name).listeners,
                    None => &mut self.global,
                };
                match event {
                    Some(event) => listeners.bind(&event, id, callback),
                    None => listeners.bind_all(id, callback),
                }
            }
            Command::Unbind { channel, event, id } => {
                let listeners = match channel {
                    Some(name) => match self.registry.get_mut(&name) {
                        Some(channel) => &mut channel.listeners,
                        None => return,
                    },
                    None => &mut self.global,
                };
                match event {
                    Some(event) => listeners.unbind(&event, id),
                    None => listeners.unbind_all(id),
                }
            }
            Command::Trigger {
                channel,
                event,
                data,
                reply,
            } => {
                let result = self.trigger(&channel, &event, &data);
                let _ = reply.send(result);
            }
            Command::Query(query) => self.answer(query),
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::SocketId(reply) => {
                let _ = reply.send(self.socket_id.clone());
            }
            Query::ChannelState { channel, reply } => {
                let _ = reply.send(self.registry.get(&channel).map(|c| c.state));
            }
            Query::SubscriptionCount { channel, reply } => {
                let _ = reply.send(
                    self.registry
                        .get(&channel)
                        .and_then(|c| c.subscription_count),
                );
            }
            Query::Members { channel, reply } => {
                let _ = reply.send(self.registry.get(&channel).and_then(|c| c.roster.clone()));
            }
        }
    }

    // ----- connection lifecycle -----

    fn connect(&mut self) {
        self.auto_reconnect = true;
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("Connect ignored, already {:?}", self.state);
            }
            _ => {
                self.reconnect_at = None;
                self.start_connect();
            }
        }
    }

    fn start_connect(&mut self) {
        let url = match self.config.socket_url() {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot connect: {}", e);
                self.auto_reconnect = false;
                self.emit_connection_error(&e.to_string());
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        if let Some(task) = self.opening.take() {
            task.abort();
        }
        self.open_attempt += 1;
        let attempt = self.open_attempt;
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let internal = self.internal_tx.clone();
        self.opening = Some(tokio::spawn(async move {
            let result = connector.open(&url).await;
            let _ = internal.send(Internal::Opened { attempt, result });
        }));
    }

    fn disconnect(&mut self) {
        self.auto_reconnect = false;
        self.reconnect_at = None;
        self.error_policy = None;
        if self.state == ConnectionState::Disconnected {
            return;
        }

        info!("Disconnecting");
        self.teardown_link();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close the socket, cancel its timers and push every channel back to
    /// awaiting a connection.
    fn teardown_link(&mut self) {
        if let Some(task) = self.opening.take() {
            task.abort();
        }
        self.link = None;
        self.socket_id = None;
        self.activity_deadline = None;
        self.pong_deadline = None;
        self.registry.connection_lost();
    }

    fn connection_lost(&mut self, policy: ReconnectPolicy) {
        let was_connected = self.state == ConnectionState::Connected;
        self.teardown_link();

        if !self.auto_reconnect {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        match policy {
            ReconnectPolicy::Refused => {
                warn!("Connection refused by the server, not reconnecting");
                self.auto_reconnect = false;
                self.set_state(ConnectionState::Unavailable);
            }
            ReconnectPolicy::Immediate => {
                info!("Reconnecting immediately");
                self.reconnect_at = Some(Instant::now());
                self.set_state(ConnectionState::Reconnecting);
            }
            ReconnectPolicy::Backoff => {
                let delay = self.backoff.next_delay();
                info!("Reconnecting in {:?}", delay);
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(if was_connected {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Unavailable
                });
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if state != ConnectionState::Connected {
            self.socket_id = None;
        }
        let previous = self.state;
        if previous == state {
            return;
        }

        debug!("Connection state {:?} -> {:?}", previous, state);
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(&ChannelEvent::new(
            events::STATE_CHANGE,
            None,
            json!({ "previous": previous, "current": state }),
        ));
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Opened { attempt, result } => self.on_opened(attempt, result),
            Internal::Authorized {
                channel,
                attempt,
                result,
            } => self.on_authorized(&channel, attempt, result),
        }
    }

    fn on_opened(&mut self, attempt: u64, result: Result<TransportLink, ReverbError>) {
        if attempt != self.open_attempt || self.state != ConnectionState::Connecting {
            debug!("Discarding stale transport from attempt {}", attempt);
            return;
        }
        self.opening = None;

        match result {
            Ok(link) => {
                debug!("Transport open, waiting for connection_established");
                self.link = Some(link);
                self.activity_deadline = Some(Instant::now() + self.config.handshake_timeout);
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                self.emit_connection_error(&e.to_string());
                self.connection_lost(ReconnectPolicy::Backoff);
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => self.handle_message(&text),
            TransportEvent::Closed { code, reason } => {
                info!("Connection closed (code: {:?}): {}", code, reason);
                let pending = self.error_policy.take();
                let policy = match (code, pending) {
                    (Some(code @ 4000..=4299), _) => ReconnectPolicy::from_code(Some(code)),
                    (_, Some(policy)) => policy,
                    (code, None) => ReconnectPolicy::from_code(code),
                };
                self.connection_lost(policy);
            }
            TransportEvent::Error(e) => {
                warn!("Transport error: {}", e);
                self.emit_connection_error(&e);
                self.connection_lost(ReconnectPolicy::Backoff);
            }
        }
    }

    fn on_activity_timeout(&mut self) {
        self.activity_deadline = None;

        if self.state != ConnectionState::Connected {
            warn!("No connection_established within {:?}", self.config.handshake_timeout);
            self.emit_connection_error("handshake timed out");
            self.connection_lost(ReconnectPolicy::Backoff);
            return;
        }

        debug!("No activity for {:?}, sending ping", self.activity_timeout);
        if self.send(message::ping_frame()) {
            self.pong_deadline = Some(Instant::now() + self.config.pong_timeout);
        } else {
            self.connection_lost(ReconnectPolicy::Backoff);
        }
    }

    fn on_pong_timeout(&mut self) {
        self.pong_deadline = None;
        warn!(
            "No pong within {:?}, treating connection as dead",
            self.config.pong_timeout
        );
        self.emit_connection_error("pong timeout");
        self.connection_lost(ReconnectPolicy::Backoff);
    }

    // ----- inbound frames -----

    fn handle_message(&mut self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame ({}): {}", e, text);
                return;
            }
        };

        self.pong_deadline = None;
        if self.state == ConnectionState::Connected {
            self.activity_deadline = Some(Instant::now() + self.activity_timeout);
        }

        match frame.event.as_str() {
            events::CONNECTION_ESTABLISHED => self.on_connection_established(frame),
            events::ERROR => self.on_error_frame(frame),
            events::PING => {
                self.send(message::pong_frame());
            }
            events::PONG => trace!("Pong received"),
            events::INTERNAL_SUBSCRIPTION_SUCCEEDED => self.on_subscription_succeeded(frame),
            events::INTERNAL_SUBSCRIPTION_ERROR => {
                if let Some(name) = frame.channel.clone() {
                    let error = ReverbError::SubscriptionError(error_message(&frame.data));
                    self.fail_subscription(&name, &error, Some(frame.data));
                }
            }
            events::INTERNAL_SUBSCRIPTION_COUNT => {
                if let Some(name) = frame.channel.as_deref()
                    && let Some(channel) = self.registry.get_mut(name)
                {
                    channel.subscription_count =
                        frame.data.get("subscription_count").and_then(Value::as_u64);
                }
                self.emit(&public_event(events::SUBSCRIPTION_COUNT, frame));
            }
            events::INTERNAL_MEMBER_ADDED => self.on_member_added(frame),
            events::INTERNAL_MEMBER_REMOVED => self.on_member_removed(frame),
            _ => {
                if frame.channel.is_some() {
                    debug!("Channel event: {} on {:?}", frame.event, frame.channel);
                }
                self.emit(&ChannelEvent {
                    event: frame.event,
                    channel: frame.channel,
                    data: frame.data,
                    user_id: frame.user_id,
                });
            }
        }
    }

    fn on_connection_established(&mut self, frame: Frame) {
        let data: ConnectionData = match serde_json::from_value(frame.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                warn!("Invalid connection_established payload: {}", e);
                return;
            }
        };
        if self.state == ConnectionState::Connected {
            // A new socket id invalidates every subscription made with the old one.
            self.registry.connection_lost();
        }

        debug!("Connection established with socket ID: {}", data.socket_id);
        self.activity_timeout = data
            .activity_timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .map_or(self.config.activity_timeout, |server| {
                server.min(self.config.activity_timeout)
            });
        self.socket_id = Some(data.socket_id);
        self.backoff.reset();
        self.error_policy = None;
        self.activity_deadline = Some(Instant::now() + self.activity_timeout);
        self.set_state(ConnectionState::Connected);
        self.emit(&ChannelEvent::new(
            events::CONNECTION_ESTABLISHED,
            None,
            frame.data,
        ));

        for name in self.registry.take_awaiting_connection() {
            self.begin_attempt(&name);
        }
    }

    fn on_error_frame(&mut self, frame: Frame) {
        let data: ErrorData =
            serde_json::from_value(frame.data.clone()).unwrap_or_else(|_| ErrorData {
                code: None,
                message: error_message(&frame.data),
            });
        error!("Reverb error: {} (code: {:?})", data.message, data.code);

        let channel = frame.channel.clone();
        match channel.as_deref() {
            Some(name)
                if self
                    .registry
                    .get(name)
                    .is_some_and(|c| c.state == SubscriptionState::Subscribing) =>
            {
                let error = ReverbError::SubscriptionError(data.message.clone());
                self.fail_subscription(name, &error, Some(frame.data.clone()));
            }
            _ => {
                if let Some(code @ 4000..=4299) = data.code {
                    self.error_policy = Some(ReconnectPolicy::from_code(Some(code)));
                }
            }
        }

        self.emit(&ChannelEvent::new(events::ERROR, channel.as_deref(), frame.data));
    }

    fn on_subscription_succeeded(&mut self, frame: Frame) {
        let Some(name) = frame.channel.clone() else {
            warn!("subscription_succeeded without a channel");
            return;
        };
        let Some(channel) = self.registry.get_mut(&name) else {
            debug!("subscription_succeeded for unknown channel {}", name);
            return;
        };
        if channel.state != SubscriptionState::Subscribing {
            debug!(
                "Ignoring subscription_succeeded for {} in state {:?}",
                name, channel.state
            );
            return;
        }

        if channel.kind.tracks_members() {
            let mut roster = Members::new(channel.me.clone());
            if let Err(e) = roster.replace_from_payload(&frame.data) {
                self.fail_subscription(&name, &e, None);
                return;
            }
            channel.roster = Some(roster);
        }
        channel.state = SubscriptionState::Subscribed;
        channel.cancel_attempt();
        debug!("Subscription succeeded for channel: {}", name);

        self.emit(&public_event(events::SUBSCRIPTION_SUCCEEDED, frame));
    }

    fn on_member_added(&mut self, frame: Frame) {
        let Some(name) = frame.channel.as_deref() else {
            return;
        };
        let member = match Member::from_value(&frame.data) {
            Ok(member) => member,
            Err(e) => {
                warn!("Dropping member_added on {}: {}", name, e);
                return;
            }
        };
        let Some(roster) = self
            .registry
            .get_mut(name)
            .and_then(|c| c.roster.as_mut())
        else {
            debug!("member_added for {} without a roster", name);
            return;
        };

        if roster.add(member.clone()) {
            self.emit(&ChannelEvent::new(
                events::MEMBER_ADDED,
                Some(name),
                json!({ "user_id": member.id, "user_info": member.info }),
            ));
        } else {
            debug!("Updated info of existing member {} on {}", member.id, name);
        }
    }

    fn on_member_removed(&mut self, frame: Frame) {
        let Some(name) = frame.channel.as_deref() else {
            return;
        };
        let Some(id) = frame.data.get("user_id").and_then(id_from_value) else {
            warn!("Dropping member_removed on {} without user_id", name);
            return;
        };
        let removed = self
            .registry
            .get_mut(name)
            .and_then(|c| c.roster.as_mut())
            .and_then(|roster| roster.remove(&id));

        if let Some(member) = removed {
            self.emit(&ChannelEvent::new(
                events::MEMBER_REMOVED,
                Some(name),
                json!({ "user_id": member.id, "user_info": member.info }),
            ));
        }
    }

    // ----- subscriptions -----

    fn subscribe(&mut self, name: &str, force: bool) {
        let connected = self.socket_id.is_some();
        let channel = self.registry.get_or_create(name);

        match channel.state {
            SubscriptionState::Subscribing => {
                debug!("Already subscribing to {}", name);
                return;
            }
            SubscriptionState::Subscribed | SubscriptionState::Failed if !force => {
                debug!("Subscribe to {} ignored in state {:?}", name, channel.state);
                return;
            }
            _ => {}
        }

        channel.state = SubscriptionState::Subscribing;
        channel.resubscribe = false;
        if connected {
            self.begin_attempt(name);
        } else {
            debug!("Deferring subscription to {} until connected", name);
        }
    }

    /// Start a subscribe attempt bound to the current socket id.
    fn begin_attempt(&mut self, name: &str) {
        let Some(socket_id) = self.socket_id.clone() else {
            return;
        };
        self.next_attempt += 1;
        let attempt_id = self.next_attempt;
        let authorizer = self.config.authorizer.clone();
        let internal = self.internal_tx.clone();

        let Some(channel) = self.registry.get_mut(name) else {
            return;
        };
        channel.state = SubscriptionState::Subscribing;
        let mut attempt = Attempt {
            id: attempt_id,
            socket_id: socket_id.clone(),
            auth_task: None,
        };

        if !channel.kind.requires_auth() {
            channel.attempt = Some(attempt);
            self.send_subscribe(name, None, None);
            return;
        }

        let Some(authorizer) = authorizer else {
            channel.cancel_attempt();
            let error = ReverbError::auth(name, "no authorizer configured");
            self.fail_subscription(name, &error, None);
            return;
        };

        debug!("Authorizing {} for socket {}", name, socket_id);
        let request = AuthRequest {
            channel_name: name.to_string(),
            socket_id,
        };
        attempt.auth_task = Some(tokio::spawn(async move {
            let result = authorizer.authorize(&request).await;
            let _ = internal.send(Internal::Authorized {
                channel: request.channel_name,
                attempt: attempt_id,
                result,
            });
        }));
        channel.attempt = Some(attempt);
    }

    fn on_authorized(
        &mut self,
        name: &str,
        attempt_id: u64,
        result: Result<AuthResponse, ReverbError>,
    ) {
        let socket_id = self.socket_id.clone();
        let Some(channel) = self.registry.get_mut(name) else {
            debug!("Discarding authorization for removed channel {}", name);
            return;
        };
        if channel.state != SubscriptionState::Subscribing {
            debug!("Discarding authorization for {} in state {:?}", name, channel.state);
            return;
        }
        if channel.attempt_id() != Some(attempt_id) {
            debug!("Discarding superseded authorization for {}", name);
            return;
        }
        let Some(attempt) = channel.attempt.as_mut() else {
            return;
        };
        if socket_id.as_deref() != Some(attempt.socket_id.as_str()) {
            debug!("Discarding authorization for {} bound to an old socket", name);
            return;
        }
        attempt.auth_task = None;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let error = match e {
                    ReverbError::AuthError { .. } => e,
                    other => ReverbError::auth(name, other.to_string()),
                };
                self.fail_subscription(name, &error, None);
                return;
            }
        };

        if channel.kind.tracks_members() {
            match response.member(name) {
                Ok(me) => channel.me = Some(me),
                Err(e) => {
                    self.fail_subscription(name, &e, None);
                    return;
                }
            }
        }

        self.send_subscribe(name, Some(&response.auth), response.channel_data.as_deref());
    }

    fn fail_subscription(&mut self, name: &str, error: &ReverbError, server_data: Option<Value>) {
        let Some(channel) = self.registry.get_mut(name) else {
            return;
        };
        error!("Subscription to {} failed: {}", name, error);
        channel.fail();

        let mut data = match error {
            ReverbError::AuthError {
                status,
                body,
                message,
                ..
            } => json!({
                "type": "AuthError",
                "error": message,
                "status": status,
                "body": body,
            }),
            other => json!({
                "type": "SubscriptionError",
                "error": other.to_string(),
                "status": null,
            }),
        };
        if let Some(server_data) = server_data {
            data["data"] = server_data;
        }
        self.emit(&ChannelEvent::new(events::SUBSCRIPTION_ERROR, Some(name), data));
    }

    fn unsubscribe(&mut self, name: &str) {
        let Some(channel) = self.registry.remove(name) else {
            debug!("Unsubscribe from unknown channel {}", name);
            return;
        };
        let on_server = matches!(
            channel.state,
            SubscriptionState::Subscribed | SubscriptionState::Subscribing
        );
        // Dropping the channel aborts any authorization still in flight.
        drop(channel);

        if on_server && self.socket_id.is_some() {
            match message::unsubscribe_frame(name) {
                Ok(frame) => {
                    debug!("Unsubscribing from {}", name);
                    self.send(frame);
                }
                Err(e) => error!("Failed to encode unsubscribe for {}: {}", name, e),
            }
        }
    }

    fn send_subscribe(&self, name: &str, auth: Option<&str>, channel_data: Option<&str>) {
        match message::subscribe_frame(name, auth, channel_data) {
            Ok(frame) => {
                debug!("Subscribing to {}", name);
                self.send(frame);
            }
            Err(e) => error!("Failed to encode subscribe for {}: {}", name, e),
        }
    }

    fn trigger(&self, channel: &str, event: &str, data: &Value) -> Result<(), ReverbError> {
        let event_name = validate_client_event(channel, event)?;
        // Subscribed implies connected: a dropped connection resets every channel.
        if !self
            .registry
            .get(channel)
            .is_some_and(|c| c.state == SubscriptionState::Subscribed)
        {
            return Err(ReverbError::UsageError(format!(
                "channel {channel} is not subscribed"
            )));
        }

        let frame = message::client_event_frame(channel, &event_name, data)?;
        match &self.link {
            Some(link) => link.send(frame),
            None => Err(ReverbError::ConnectionError("Not connected".to_string())),
        }
    }

    // ----- outbound & dispatch helpers -----

    /// Queue a frame on the socket. Never waits on the peer.
    fn send(&self, frame: String) -> bool {
        let Some(link) = &self.link else {
            warn!("No active connection, dropping frame");
            return false;
        };
        trace!("Sending message: {}", frame);
        if let Err(e) = link.send(frame) {
            warn!("Error sending message: {}", e);
            return false;
        }
        true
    }

    fn emit_connection_error(&self, message: &str) {
        self.emit(&ChannelEvent::new(
            events::CONNECTION_ERROR,
            None,
            json!({ "type": "TransportError", "error": message }),
        ));
    }

    /// Deliver to the channel's listeners, then to global listeners.
    fn emit(&self, event: &ChannelEvent) {
        let mut handlers = Vec::new();
        if let Some(name) = event.channel.as_deref()
            && let Some(channel) = self.registry.get(name)
        {
            handlers.extend(channel.listeners.handlers_for(&event.event));
        }
        handlers.extend(self.global.handlers_for(&event.event));

        for handler in handlers {
            handler(event);
        }
    }
}

fn public_event(name: &str, frame: Frame) -> ChannelEvent {
    ChannelEvent {
        event: name.to_string(),
        channel: frame.channel,
        data: frame.data,
        user_id: frame.user_id,
    }
}

fn error_message(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

async fn next_transport_event(link: &mut Option<TransportLink>) -> TransportEvent {
    match link {
        Some(link) => link
            .incoming
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Closed {
                code: None,
                reason: "transport dropped".to_string(),
            }),
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
