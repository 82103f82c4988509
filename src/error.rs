use thiserror::Error;

/// Error types for the reverb-channels library
#[derive(Error, Debug)]
pub enum ReverbError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),
    /// Authorization for a private or presence channel was refused or unreadable.
    ///
    /// `status` and `body` carry the raw HTTP response when the authorizer is
    /// HTTP-backed, so the failure can be diagnosed from the channel's error event.
    #[error("Channel authorization failed for {channel}: {message}")]
    AuthError {
        channel: String,
        status: Option<u16>,
        body: Option<String>,
        message: String,
    },
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Subscription error: {0}")]
    SubscriptionError(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Usage error: {0}")]
    UsageError(String),
    #[error("Send error: {0}")]
    SendError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ReverbError {
    /// Shorthand for an authorization failure that has no HTTP response attached.
    pub fn auth(channel: &str, message: impl Into<String>) -> Self {
        ReverbError::AuthError {
            channel: channel.to_string(),
            status: None,
            body: None,
            message: message.into(),
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, ReverbError::UsageError(_))
    }
}
