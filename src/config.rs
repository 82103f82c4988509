use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::auth::{Authorizer, HttpAuthorizer, SecretAuthorizer};
use crate::backoff::Backoff;
use crate::error::ReverbError;

pub const PROTOCOL_VERSION: u8 = 7;
pub const DEFAULT_CLUSTER: &str = "mt1";
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
///
/// ```
/// use reverb_channels::ClientConfig;
///
/// let config = ClientConfig::new("app-key")
///     .with_host("reverb.example.com")
///     .with_port(8080)
///     .with_tls(false)
///     .with_auth_endpoint("http://reverb.example.com/broadcasting/auth");
/// assert_eq!(
///     config.socket_url().unwrap().as_str(),
///     "ws://reverb.example.com:8080/app/app-key?protocol=7&client=reverb-channels&version=0.1.0&flash=false"
/// );
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    pub app_key: String,
    pub cluster: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secure: bool,
    pub activity_timeout: Duration,
    pub pong_timeout: Duration,
    pub handshake_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: bool,
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("app_key", &self.app_key)
            .field("cluster", &self.cluster)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("activity_timeout", &self.activity_timeout)
            .field("pong_timeout", &self.pong_timeout)
            .field("authorizer", &self.authorizer.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    pub fn new(app_key: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            cluster: None,
            host: None,
            port: None,
            secure: true,
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            backoff_jitter: true,
            authorizer: None,
        }
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_tls(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Upper bound for the activity timeout; the server may announce a shorter one.
    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = timeout;
        self
    }

    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    pub fn with_backoff_jitter(mut self, jitter: bool) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    pub fn with_authorizer<A: Authorizer + 'static>(mut self, authorizer: A) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Set authentication endpoint, using the HTTP authorizer with default settings
    pub fn with_auth_endpoint(self, endpoint: &str) -> Self {
        self.with_authorizer(HttpAuthorizer::new(endpoint))
    }

    /// Set application secret for server-side authentication
    pub fn with_app_secret(self, secret: &str) -> Self {
        let authorizer = SecretAuthorizer::new(&self.app_key, secret);
        self.with_authorizer(authorizer)
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_min, self.backoff_max, self.backoff_jitter)
    }

    pub fn socket_url(&self) -> Result<Url, ReverbError> {
        if self.app_key.is_empty() {
            return Err(ReverbError::ConfigError("app key is empty".to_string()));
        }

        let host = match (&self.host, &self.cluster) {
            (Some(host), _) => host.clone(),
            (None, Some(cluster)) => format!("ws-{cluster}.pusher.com"),
            (None, None) => format!("ws-{DEFAULT_CLUSTER}.pusher.com"),
        };
        let scheme = if self.secure { "wss" } else { "ws" };
        let port = self.port.unwrap_or(if self.secure { 443 } else { 80 });

        let mut url = Url::parse(&format!(
            "{}://{}:{}/app/{}",
            scheme, host, port, self.app_key
        ))?;
        url.query_pairs_mut()
            .append_pair("protocol", &PROTOCOL_VERSION.to_string())
            .append_pair("client", env!("CARGO_PKG_NAME"))
            .append_pair("version", env!("CARGO_PKG_VERSION"))
            .append_pair("flash", "false");
        Ok(url)
    }
}
