use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ReverbError;
use crate::event::EventDispatcher;
use crate::message::events;
use crate::presence::{Member, Members};

pub const PRIVATE_PREFIX: &str = "private-";
pub const PRESENCE_PREFIX: &str = "presence-";

/// Channel kind, derived from the channel name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(PRESENCE_PREFIX) {
            ChannelKind::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    /// Check if the channel requires authentication
    pub fn requires_auth(&self) -> bool {
        !matches!(self, ChannelKind::Public)
    }

    pub fn accepts_client_events(&self) -> bool {
        self.requires_auth()
    }

    pub fn tracks_members(&self) -> bool {
        matches!(self, ChannelKind::Presence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Failed,
}

/// Helper function to build a private channel name
pub fn private_channel(name: &str) -> String {
    if name.starts_with(PRIVATE_PREFIX) {
        name.to_string()
    } else {
        format!("{PRIVATE_PREFIX}{name}")
    }
}

/// Helper function to build a presence channel name
pub fn presence_channel(name: &str) -> String {
    if name.starts_with(PRESENCE_PREFIX) {
        name.to_string()
    } else {
        format!("{PRESENCE_PREFIX}{name}")
    }
}

/// Check that a client event may be sent on `channel`, returning the
/// event name as it goes on the wire (`client-` prefixed).
pub fn validate_client_event(channel: &str, event: &str) -> Result<String, ReverbError> {
    if !ChannelKind::from_name(channel).accepts_client_events() {
        return Err(ReverbError::UsageError(format!(
            "client events can only be triggered on private or presence channels, not {channel}"
        )));
    }
    if event.starts_with(events::PUSHER_PREFIX) || event.starts_with(events::INTERNAL_PREFIX) {
        return Err(ReverbError::UsageError(format!(
            "{event} is a reserved system event name"
        )));
    }

    let event_name = if event.starts_with(events::CLIENT_PREFIX) {
        event.to_string()
    } else {
        format!("{}{}", events::CLIENT_PREFIX, event)
    };
    if event_name.len() == events::CLIENT_PREFIX.len() {
        return Err(ReverbError::UsageError("client event name is empty".into()));
    }
    Ok(event_name)
}

/// A subscribe attempt in progress.
///
/// `auth_task` is set while an authorization request is outstanding; it is
/// aborted when the attempt is superseded.
#[derive(Debug)]
pub(crate) struct Attempt {
    pub id: u64,
    pub socket_id: String,
    pub auth_task: Option<JoinHandle<()>>,
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if let Some(task) = self.auth_task.take() {
            task.abort();
        }
    }
}

/// Per-channel state held by the registry.
#[derive(Debug)]
pub(crate) struct Channel {
    pub name: String,
    pub kind: ChannelKind,
    pub state: SubscriptionState,
    /// Subscribe again on the next successful connect.
    pub resubscribe: bool,
    pub attempt: Option<Attempt>,
    /// Identity from the last presence authorization.
    pub me: Option<Member>,
    /// Present only while a presence channel is subscribed.
    pub roster: Option<Members>,
    pub subscription_count: Option<u64>,
    pub listeners: EventDispatcher,
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ChannelKind::from_name(name),
            state: SubscriptionState::Unsubscribed,
            resubscribe: false,
            attempt: None,
            me: None,
            roster: None,
            subscription_count: None,
            listeners: EventDispatcher::new(),
        }
    }

    pub fn attempt_id(&self) -> Option<u64> {
        self.attempt.as_ref().map(|a| a.id)
    }

    /// Drop any in-flight attempt along with its authorization task.
    pub fn cancel_attempt(&mut self) {
        self.attempt = None;
    }

    pub fn fail(&mut self) {
        self.cancel_attempt();
        self.state = SubscriptionState::Failed;
        self.resubscribe = false;
        self.roster = None;
    }

    /// Connection lost: anything subscribed or on its way there is retried later.
    pub fn connection_lost(&mut self) {
        self.cancel_attempt();
        if matches!(
            self.state,
            SubscriptionState::Subscribed | SubscriptionState::Subscribing
        ) {
            self.state = SubscriptionState::Unsubscribed;
            self.resubscribe = true;
        }
        self.roster = None;
        self.subscription_count = None;
    }

    /// Whether this channel should start an attempt once a socket id is known.
    pub fn awaiting_connection(&self) -> bool {
        match self.state {
            SubscriptionState::Subscribing => self.attempt.is_none(),
            SubscriptionState::Unsubscribed => self.resubscribe,
            _ => false,
        }
    }
}

/// Channel registry: name to channel, created on first use.
#[derive(Debug, Default)]
pub(crate) struct ChannelRegistry {
    channels: HashMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, name: &str) -> &mut Channel {
        self.channels.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating channel {}", name);
            Channel::new(name)
        })
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Channel> {
        self.channels.remove(name)
    }

    pub fn connection_lost(&mut self) {
        for channel in self.channels.values_mut() {
            channel.connection_lost();
        }
    }

    /// Names of channels to (re)subscribe now that the connection is up,
    /// each moved to `Subscribing`.
    pub fn take_awaiting_connection(&mut self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .values_mut()
            .filter(|c| c.awaiting_connection())
            .map(|c| {
                c.state = SubscriptionState::Subscribing;
                c.resubscribe = false;
                c.name.clone()
            })
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_derived_from_prefix() {
        assert_eq!(ChannelKind::from_name("private-room.1"), ChannelKind::Private);
        assert_eq!(ChannelKind::from_name("private-encrypted-x"), ChannelKind::Private);
        assert_eq!(ChannelKind::from_name("presence-lobby"), ChannelKind::Presence);
        assert_eq!(ChannelKind::from_name("my-channel"), ChannelKind::Public);
        assert_eq!(ChannelKind::from_name("Private-caps"), ChannelKind::Public);
        assert_eq!(ChannelKind::from_name("privatechat"), ChannelKind::Public);
        assert_eq!(ChannelKind::from_name(""), ChannelKind::Public);
    }

    #[test]
    fn name_helpers_add_prefix_once() {
        assert_eq!(private_channel("orders"), "private-orders");
        assert_eq!(private_channel("private-orders"), "private-orders");
        assert_eq!(presence_channel("lobby"), "presence-lobby");
        assert_eq!(presence_channel("presence-lobby"), "presence-lobby");
    }

    #[test]
    fn client_events_are_prefixed_and_restricted() {
        assert_eq!(
            validate_client_event("private-chat", "typing").unwrap(),
            "client-typing"
        );
        assert_eq!(
            validate_client_event("presence-room", "client-typing").unwrap(),
            "client-typing"
        );
        assert!(validate_client_event("my-channel", "foo").unwrap_err().is_usage());
        assert!(
            validate_client_event("private-chat", "pusher:subscribe")
                .unwrap_err()
                .is_usage()
        );
        assert!(validate_client_event("private-chat", "client-").is_err());
    }

    #[test]
    fn connection_loss_marks_channels_for_resubscription() {
        let mut registry = ChannelRegistry::new();
        registry.get_or_create("news").state = SubscriptionState::Subscribed;
        registry.get_or_create("private-a").state = SubscriptionState::Subscribing;
        registry.get_or_create("private-b").state = SubscriptionState::Failed;
        registry.get_or_create("bound-only");

        registry.connection_lost();
        assert_eq!(
            registry.get("news").unwrap().state,
            SubscriptionState::Unsubscribed
        );
        assert_eq!(
            registry.get("private-b").unwrap().state,
            SubscriptionState::Failed
        );

        let names = registry.take_awaiting_connection();
        assert_eq!(names, vec!["news".to_string(), "private-a".to_string()]);
        assert_eq!(
            registry.get("news").unwrap().state,
            SubscriptionState::Subscribing
        );
        assert!(registry.take_awaiting_connection().is_empty());
    }

    #[test]
    fn failing_discards_roster() {
        let mut channel = Channel::new("presence-room");
        channel.state = SubscriptionState::Subscribed;
        channel.roster = Some(Members::default());
        channel.fail();
        assert_eq!(channel.state, SubscriptionState::Failed);
        assert!(channel.roster.is_none());
    }
}
