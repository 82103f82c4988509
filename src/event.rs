use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// An event delivered to application callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub event: String,
    /// `None` for connection-level events.
    pub channel: Option<String>,
    pub data: Value,
    /// Sender of a client event on a presence channel, when the server supplies it.
    pub user_id: Option<String>,
}

impl ChannelEvent {
    pub fn new(event: &str, channel: Option<&str>, data: Value) -> Self {
        Self {
            event: event.to_string(),
            channel: channel.map(str::to_string),
            data,
            user_id: None,
        }
    }
}

pub type Callback = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Identity of a registered callback, used to unbind it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub(crate) u64);

#[derive(Clone)]
struct Binding {
    id: BindingId,
    callback: Callback,
}

/// Listener table: event name to callbacks, plus catch-all callbacks.
///
/// Used both per channel and for the client-wide (global) bindings.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    by_event: HashMap<String, Vec<Binding>>,
    catch_all: Vec<Binding>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("events", &self.by_event.keys().collect::<Vec<_>>())
            .field("catch_all", &self.catch_all.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, event: &str, id: BindingId, callback: Callback) {
        self.by_event
            .entry(event.to_string())
            .or_default()
            .push(Binding { id, callback });
    }

    pub fn bind_all(&mut self, id: BindingId, callback: Callback) {
        self.catch_all.push(Binding { id, callback });
    }

    /// Remove one callback for `event`, or every callback for it when `id` is `None`.
    pub fn unbind(&mut self, event: &str, id: Option<BindingId>) {
        match id {
            Some(id) => {
                if let Some(bindings) = self.by_event.get_mut(event) {
                    bindings.retain(|b| b.id != id);
                    if bindings.is_empty() {
                        self.by_event.remove(event);
                    }
                }
            }
            None => {
                self.by_event.remove(event);
            }
        }
    }

    pub fn unbind_all(&mut self, id: Option<BindingId>) {
        match id {
            Some(id) => self.catch_all.retain(|b| b.id != id),
            None => self.catch_all.clear(),
        }
    }

    /// Callbacks for `event` followed by the catch-all callbacks, in registration order.
    pub fn handlers_for(&self, event: &str) -> Vec<Callback> {
        self.by_event
            .get(event)
            .into_iter()
            .flatten()
            .chain(self.catch_all.iter())
            .map(|b| Arc::clone(&b.callback))
            .collect()
    }
}
