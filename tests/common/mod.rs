//! Shared harness for the client integration tests.
//!
//! `MockConnector` hands every opened socket to the test as a `MockServer`,
//! and `AuthDesk` lets the test answer authorization requests by hand.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reverb_channels::{
    AuthRequest, AuthResponse, Authorizer, ChannelEvent, ClientConfig, ConnectionState,
    Connector, ReverbClient, ReverbError, TransportEvent, TransportLink,
};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use url::Url;

const WAIT: Duration = Duration::from_secs(60);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("reverb_channels=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// The server end of one socket opened by the client.
pub struct MockServer {
    pub url: Url,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl MockServer {
    pub fn send(&self, frame: Value) {
        self.send_raw(&frame.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(TransportEvent::Message(text.to_string()));
    }

    pub fn establish(&self, socket_id: &str) {
        self.send(json!({
            "event": "pusher:connection_established",
            "data": json!({ "socket_id": socket_id, "activity_timeout": 120 }).to_string(),
        }));
    }

    pub fn succeed(&self, channel: &str) {
        self.send(json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": channel,
            "data": "{}",
        }));
    }

    pub fn event(&self, channel: &str, event: &str, data: Value) {
        self.send(json!({
            "event": event,
            "channel": channel,
            "data": data.to_string(),
        }));
    }

    pub fn close(&self, code: Option<u16>) {
        let _ = self.to_client.send(TransportEvent::Closed {
            code,
            reason: "closed by server".to_string(),
        });
    }

    /// Next frame sent by the client.
    pub async fn next_frame(&mut self) -> Value {
        let text = timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the socket");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Assert the client sends nothing for a while.
    pub async fn assert_silent(&mut self) {
        match timeout(Duration::from_millis(200), self.from_client.recv()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(frame)) => panic!("unexpected frame from client: {frame}"),
        }
    }

    /// Wait for the client to drop the socket.
    pub async fn closed(&mut self) {
        loop {
            match timeout(WAIT, self.from_client.recv()).await {
                Ok(None) => return,
                Ok(Some(_)) => continue,
                Err(_) => panic!("client kept the socket open"),
            }
        }
    }
}

#[derive(Clone)]
pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    refusals: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &Url) -> Result<TransportLink, ReverbError> {
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ReverbError::ConnectionError("connection refused".to_string()));
        }

        let (outgoing, from_client) = mpsc::unbounded_channel();
        let (to_client, incoming) = mpsc::unbounded_channel();
        let server = MockServer {
            url: url.clone(),
            from_client,
            to_client,
        };
        self.servers
            .send(server)
            .map_err(|_| ReverbError::ConnectionError("test finished".to_string()))?;
        Ok(TransportLink::new(outgoing, incoming))
    }
}

type AuthReply = oneshot::Sender<Result<AuthResponse, ReverbError>>;

/// Authorizer whose requests are answered by the test.
pub struct ScriptedAuthorizer {
    requests: mpsc::UnboundedSender<(AuthRequest, AuthReply)>,
}

#[async_trait]
impl Authorizer for ScriptedAuthorizer {
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthResponse, ReverbError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send((request.clone(), reply))
            .map_err(|_| ReverbError::auth(&request.channel_name, "test finished"))?;
        response
            .await
            .map_err(|_| ReverbError::auth(&request.channel_name, "request dropped"))?
    }
}

pub struct AuthDesk {
    requests: mpsc::UnboundedReceiver<(AuthRequest, AuthReply)>,
}

impl AuthDesk {
    pub async fn next(&mut self) -> (AuthRequest, AuthReply) {
        timeout(WAIT, self.requests.recv())
            .await
            .expect("timed out waiting for an authorization request")
            .expect("authorizer dropped")
    }

    pub async fn assert_idle(&mut self) {
        if let Ok(Some((request, _))) =
            timeout(Duration::from_millis(200), self.requests.recv()).await
        {
            panic!("unexpected authorization request: {request:?}");
        }
    }
}

pub fn auth_ok(auth: &str) -> Result<AuthResponse, ReverbError> {
    Ok(AuthResponse {
        auth: auth.to_string(),
        channel_data: None,
    })
}

pub struct Harness {
    pub client: ReverbClient,
    pub auth: AuthDesk,
    pub refusals: Arc<AtomicUsize>,
    servers: mpsc::UnboundedReceiver<MockServer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(adjust: impl FnOnce(ClientConfig) -> ClientConfig) -> Self {
        init_tracing();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (servers_tx, servers) = mpsc::unbounded_channel();
        let refusals = Arc::new(AtomicUsize::new(0));

        let config = ClientConfig::new("app-key")
            .with_host("localhost")
            .with_port(8080)
            .with_tls(false)
            .with_backoff_jitter(false)
            .with_authorizer(ScriptedAuthorizer {
                requests: requests_tx,
            });
        let connector = MockConnector {
            servers: servers_tx,
            refusals: Arc::clone(&refusals),
        };
        let client = ReverbClient::with_connector(adjust(config), connector)
            .expect("valid test config");

        Self {
            client,
            auth: AuthDesk { requests },
            refusals,
            servers,
        }
    }

    pub async fn next_server(&mut self) -> MockServer {
        timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for the client to connect")
            .expect("connector dropped")
    }

    /// Assert no socket is opened for a while.
    pub async fn assert_no_server(&mut self, wait: Duration) {
        if let Ok(Some(server)) = timeout(wait, self.servers.recv()).await {
            panic!("unexpected connection to {}", server.url);
        }
    }

    /// Connect and complete the handshake with `socket_id`.
    pub async fn connected(&mut self, socket_id: &str) -> MockServer {
        self.client.connect().unwrap();
        let server = self.next_server().await;
        server.establish(socket_id);
        timeout(WAIT, self.client.wait_for_state(ConnectionState::Connected))
            .await
            .expect("timed out waiting for Connected")
            .unwrap();
        server
    }

    /// Collect events delivered to a binding.
    pub fn collect(&self, channel: Option<&str>, event: &str) -> Events {
        let (tx, rx) = mpsc::unbounded_channel();
        self.client.bind(channel, event, move |event| {
            let _ = tx.send(event.clone());
        });
        Events { rx }
    }
}

pub struct Events {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Events {
    pub async fn next(&mut self) -> ChannelEvent {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("binding dropped")
    }

    /// Events delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
