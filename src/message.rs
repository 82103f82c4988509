use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReverbError;

/// Event names used on the wire by the Pusher protocol.
pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";

    pub const INTERNAL_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const INTERNAL_SUBSCRIPTION_ERROR: &str = "pusher_internal:subscription_error";
    pub const INTERNAL_SUBSCRIPTION_COUNT: &str = "pusher_internal:subscription_count";
    pub const INTERNAL_MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const INTERNAL_MEMBER_REMOVED: &str = "pusher_internal:member_removed";

    /// Names under which system events are delivered to application callbacks.
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher:subscription_succeeded";
    pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
    pub const SUBSCRIPTION_COUNT: &str = "pusher:subscription_count";
    pub const MEMBER_ADDED: &str = "pusher:member_added";
    pub const MEMBER_REMOVED: &str = "pusher:member_removed";

    /// Connection-level notifications, delivered to global bindings only.
    pub const STATE_CHANGE: &str = "state_change";
    pub const CONNECTION_ERROR: &str = "error";

    pub const CLIENT_PREFIX: &str = "client-";
    pub const PUSHER_PREFIX: &str = "pusher:";
    pub const INTERNAL_PREFIX: &str = "pusher_internal:";
}

/// Pusher protocol message structure as received from the server
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PusherMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub user_id: Option<Value>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    pub channel: Option<String>,
    pub data: Value,
    pub user_id: Option<String>,
}

impl Frame {
    /// Decode a text message into a frame.
    ///
    /// Servers usually send `data` as a JSON-encoded string; it is decoded a
    /// second time when possible and kept as a plain string otherwise.
    pub fn decode(text: &str) -> Result<Self, ReverbError> {
        let message: PusherMessage = serde_json::from_str(text)?;
        if message.event.is_empty() {
            return Err(ReverbError::ProtocolError(
                "frame has an empty event name".to_string(),
            ));
        }

        let data = match message.data {
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            other => other,
        };

        Ok(Self {
            event: message.event,
            channel: message.channel,
            data,
            user_id: message.user_id.as_ref().and_then(id_from_value),
        })
    }
}

/// Presence ids may arrive as strings or numbers; both are keyed as strings.
pub(crate) fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Connection data received after establishing connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionData {
    pub socket_id: String,
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

/// Error data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: String,
}

/// Subscribe message structure
#[derive(Debug, Clone, Serialize)]
pub(crate) struct SubscribeMessage<'a> {
    pub event: &'static str,
    pub data: SubscribeData<'a>,
}

/// Subscribe data structure
#[derive(Debug, Clone, Serialize)]
pub(crate) struct SubscribeData<'a> {
    pub channel: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<&'a str>,
}

/// Client event message structure
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ClientEventMessage<'a> {
    pub event: &'a str,
    pub channel: &'a str,
    pub data: &'a Value,
}

pub(crate) fn subscribe_frame(
    channel: &str,
    auth: Option<&str>,
    channel_data: Option<&str>,
) -> Result<String, ReverbError> {
    let message = SubscribeMessage {
        event: events::SUBSCRIBE,
        data: SubscribeData {
            channel,
            auth,
            channel_data,
        },
    };
    Ok(serde_json::to_string(&message)?)
}

pub(crate) fn unsubscribe_frame(channel: &str) -> Result<String, ReverbError> {
    let message = SubscribeMessage {
        event: events::UNSUBSCRIBE,
        data: SubscribeData {
            channel,
            auth: None,
            channel_data: None,
        },
    };
    Ok(serde_json::to_string(&message)?)
}

pub(crate) fn ping_frame() -> String {
    serde_json::json!({ "event": events::PING, "data": {} }).to_string()
}

pub(crate) fn pong_frame() -> String {
    serde_json::json!({ "event": events::PONG, "data": {} }).to_string()
}

pub(crate) fn client_event_frame(
    channel: &str,
    event: &str,
    data: &Value,
) -> Result<String, ReverbError> {
    let message = ClientEventMessage {
        event,
        channel,
        data,
    };
    Ok(serde_json::to_string(&message)?)
}
