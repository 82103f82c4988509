use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ReverbError;
use crate::presence::Member;

/// Input to an authorization: one channel, one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub channel_name: String,
    pub socket_id: String,
}

/// A successful authorization.
///
/// The signature is only valid for the socket id it was requested with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub auth: String,
    /// JSON-encoded `{user_id, user_info}` identity; required for presence channels.
    pub channel_data: Option<String>,
}

impl AuthResponse {
    /// Parse an authorization endpoint response body.
    ///
    /// Some servers return `channel_data` as an object rather than a string;
    /// both are accepted and the identity is kept in its encoded form.
    pub fn from_body(channel: &str, body: &str) -> Result<Self, ReverbError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| ReverbError::auth(channel, format!("malformed response: {e}")))?;
        let auth = value
            .get("auth")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ReverbError::auth(channel, "response has no auth signature"))?
            .to_string();
        let channel_data = match value.get("channel_data") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        Ok(Self { auth, channel_data })
    }

    /// Decode the nested identity payload of a presence authorization.
    pub fn member(&self, channel: &str) -> Result<Member, ReverbError> {
        let encoded = self
            .channel_data
            .as_deref()
            .ok_or_else(|| ReverbError::auth(channel, "presence authorization has no channel_data"))?;
        let value: Value = serde_json::from_str(encoded)
            .map_err(|e| ReverbError::auth(channel, format!("invalid channel_data: {e}")))?;
        Member::from_value(&value).map_err(|e| ReverbError::auth(channel, e.to_string()))
    }
}

/// Produces signatures for private and presence channel subscriptions.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthResponse, ReverbError>;
}

/// Supplies extra request headers, computed per request (e.g. a fresh bearer token).
#[async_trait]
pub trait HeadersProvider: Send + Sync {
    async fn headers(&self) -> Result<Vec<(String, String)>, ReverbError>;
}

#[async_trait]
impl<F, Fut> HeadersProvider for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<(String, String)>, ReverbError>> + Send,
{
    async fn headers(&self) -> Result<Vec<(String, String)>, ReverbError> {
        (self)().await
    }
}

/// How `socket_id` and `channel_name` reach the authorization endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthParamsEncoding {
    /// POST `application/x-www-form-urlencoded` body (Laravel, pusher-js default).
    #[default]
    Form,
    /// POST JSON body.
    Json,
    /// GET with query parameters.
    Query,
}

/// Authorizer backed by an HTTP endpoint such as Laravel's `/broadcasting/auth`.
pub struct HttpAuthorizer {
    endpoint: String,
    encoding: AuthParamsEncoding,
    headers: Vec<(String, String)>,
    headers_provider: Option<Arc<dyn HeadersProvider>>,
    csrf_cookie_url: Option<String>,
    csrf_token: Mutex<Option<String>>,
    http_client: HttpClient,
}

impl HttpAuthorizer {
    pub fn new(endpoint: &str) -> Self {
        let http_client = HttpClient::builder()
            .cookie_store(true)
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            endpoint: endpoint.to_string(),
            encoding: AuthParamsEncoding::default(),
            headers: Vec::new(),
            headers_provider: None,
            csrf_cookie_url: None,
            csrf_token: Mutex::new(None),
            http_client,
        }
    }

    pub fn with_encoding(mut self, encoding: AuthParamsEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_headers_provider<P: HeadersProvider + 'static>(mut self, provider: P) -> Self {
        self.headers_provider = Some(Arc::new(provider));
        self
    }

    /// Fetch an `XSRF-TOKEN` cookie from `url` before the first request and
    /// send it back as `X-CSRF-TOKEN`.
    pub fn with_csrf_cookie(mut self, url: &str) -> Self {
        self.csrf_cookie_url = Some(url.to_string());
        self
    }

    pub fn with_http_client(mut self, client: HttpClient) -> Self {
        self.http_client = client;
        self
    }

    /// Get CSRF token from server
    async fn csrf_token(&self, url: &str) -> Result<String, ReverbError> {
        let mut cached = self.csrf_token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let response = self.http_client.get(url).send().await?;
        let token = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|h| h.to_str().ok())
            .find_map(extract_xsrf_token)
            .ok_or_else(|| ReverbError::ConnectionError("Failed to get CSRF token".to_string()))?;

        *cached = Some(token.clone());
        Ok(token)
    }
}

fn extract_xsrf_token(cookie: &str) -> Option<String> {
    let start = cookie.find("XSRF-TOKEN=")? + "XSRF-TOKEN=".len();
    let rest = &cookie[start..];
    let raw = rest.split(';').next().unwrap_or(rest);
    urlencoding::decode(raw).ok().map(|t| t.into_owned())
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthResponse, ReverbError> {
        let channel = request.channel_name.as_str();
        let params = [
            ("socket_id", request.socket_id.as_str()),
            ("channel_name", channel),
        ];

        let mut builder = match self.encoding {
            AuthParamsEncoding::Form => self.http_client.post(&self.endpoint).form(&params),
            AuthParamsEncoding::Json => self.http_client.post(&self.endpoint).json(
                &serde_json::json!({ "socket_id": request.socket_id, "channel_name": channel }),
            ),
            AuthParamsEncoding::Query => self.http_client.get(&self.endpoint).query(&params),
        };

        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(provider) = &self.headers_provider {
            for (name, value) in provider.headers().await? {
                builder = builder.header(name, value);
            }
        }
        if let Some(url) = &self.csrf_cookie_url {
            builder = builder.header("X-CSRF-TOKEN", self.csrf_token(url).await?);
        }

        debug!("Requesting authorization for {} from {}", channel, self.endpoint);
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!("Authorization for {} rejected with {}", channel, status);
            return Err(ReverbError::AuthError {
                channel: channel.to_string(),
                status: Some(status.as_u16()),
                body: Some(body),
                message: format!("Authentication failed: {status}"),
            });
        }

        AuthResponse::from_body(channel, &body).map_err(|e| match e {
            ReverbError::AuthError { message, .. } => ReverbError::AuthError {
                channel: channel.to_string(),
                status: Some(status.as_u16()),
                body: Some(body.clone()),
                message,
            },
            other => other,
        })
    }
}

/// Signs subscriptions locally with the application secret.
///
/// Only suitable where the secret may be held, such as backend services.
pub struct SecretAuthorizer {
    app_key: String,
    app_secret: String,
    user: Option<Member>,
}

impl SecretAuthorizer {
    pub fn new(app_key: &str, app_secret: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            user: None,
        }
    }

    /// Identity announced on presence channels.
    pub fn with_user(mut self, user_id: &str, user_info: Value) -> Self {
        self.user = Some(Member {
            id: user_id.to_string(),
            info: user_info,
        });
        self
    }

    /// Auth format: app_key:hex_encoded_hmac
    fn sign(&self, payload: &str) -> Result<String, ReverbError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.app_secret.as_bytes())
            .map_err(|_| ReverbError::ConfigError("HMAC creation failed".to_string()))?;
        mac.update(payload.as_bytes());
        let result = mac.finalize().into_bytes();
        Ok(format!("{}:{}", self.app_key, hex::encode(result)))
    }
}

#[async_trait]
impl Authorizer for SecretAuthorizer {
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthResponse, ReverbError> {
        let channel = request.channel_name.as_str();

        if !channel.starts_with(crate::channel::PRESENCE_PREFIX) {
            // socket_id:channel_name
            let auth = self.sign(&format!("{}:{}", request.socket_id, channel))?;
            return Ok(AuthResponse {
                auth,
                channel_data: None,
            });
        }

        let user = self
            .user
            .as_ref()
            .ok_or_else(|| ReverbError::auth(channel, "no user configured for presence channels"))?;
        let channel_data = serde_json::json!({
            "user_id": user.id,
            "user_info": user.info,
        })
        .to_string();
        // socket_id:channel_name:channel_data
        let auth = self.sign(&format!("{}:{}:{}", request.socket_id, channel, channel_data))?;
        Ok(AuthResponse {
            auth,
            channel_data: Some(channel_data),
        })
    }
}
