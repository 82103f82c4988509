// src/lib.rs

//! Pusher-protocol channels client for Laravel Reverb and compatible servers.
//!
//! ```no_run
//! use reverb_channels::{ClientConfig, ConnectionState, ReverbClient};
//!
//! # async fn run() -> Result<(), reverb_channels::ReverbError> {
//! let config = ClientConfig::new("app-key")
//!     .with_host("reverb.example.com")
//!     .with_auth_endpoint("https://example.com/broadcasting/auth");
//! let client = ReverbClient::new(config)?;
//!
//! client.bind(Some("private-orders"), "OrderShipped", |event| {
//!     println!("shipped: {}", event.data);
//! });
//! client.subscribe("private-orders")?;
//! client.connect()?;
//! client.wait_for_state(ConnectionState::Connected).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
mod engine;
pub mod error;
pub mod event;
pub mod message;
pub mod presence;

pub use auth::{
    AuthParamsEncoding, AuthRequest, AuthResponse, Authorizer, HeadersProvider, HttpAuthorizer,
    SecretAuthorizer,
};
pub use channel::{ChannelKind, SubscriptionState, presence_channel, private_channel};
pub use client::ReverbClient;
pub use config::ClientConfig;
pub use connection::{ConnectionState, Connector, TransportEvent, TransportLink, WebSocketConnector};
pub use error::ReverbError;
pub use event::{BindingId, ChannelEvent};
pub use presence::{Member, Members};
