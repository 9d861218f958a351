use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use futures_channel::mpsc;
use resclient_core::ResError;

use crate::resource::Value;

/// Identifier of a registered listener, used to unregister it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An event delivered for a single cached resource.
#[derive(Clone, Debug)]
pub enum ResourceEvent {
    /// A model changed. Maps the changed keys to their previous values;
    /// `None` means the key was absent before the change.
    Change {
        /// Previous values of exactly the keys that changed.
        old_values: HashMap<String, Option<Value>>,
    },
    /// A collection gained an element.
    Add {
        /// Insertion index.
        idx: usize,
        /// The inserted value.
        value: Value,
    },
    /// A collection lost an element.
    Remove {
        /// Removal index.
        idx: usize,
        /// The removed value.
        value: Value,
    },
    /// The server dropped the subscription for this resource.
    Unsubscribe,
    /// An application-defined event, passed through unchanged.
    Custom {
        /// The event name.
        name: String,
        /// The raw event payload.
        data: Option<serde_json::Value>,
    },
}

impl ResourceEvent {
    /// The event name as it appears on the wire.
    pub fn name(&self) -> &str {
        match self {
            ResourceEvent::Change { .. } => "change",
            ResourceEvent::Add { .. } => "add",
            ResourceEvent::Remove { .. } => "remove",
            ResourceEvent::Unsubscribe => "unsubscribe",
            ResourceEvent::Custom { name, .. } => name,
        }
    }
}

/// A client-level event.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The connection is open and the on-connect hook has resolved.
    Connect,
    /// The connection closed.
    Close,
    /// An error bound to a call, surfaced for observability.
    Error(ResError),
}

impl ClientEvent {
    /// The event name.
    pub fn name(&self) -> &str {
        match self {
            ClientEvent::Connect => "connect",
            ClientEvent::Close => "close",
            ClientEvent::Error(_) => "error",
        }
    }
}

// `None` = all events.
type Filter = Option<Vec<String>>;

fn parse_filter(filter: Option<&str>) -> Filter {
    filter.map(|f| f.split(',').map(|s| s.trim().to_owned()).filter(|s| !s.is_empty()).collect())
}

fn filter_matches(filter: &Filter, name: &str) -> bool {
    match filter {
        None => true,
        Some(names) => names.iter().any(|n| n == name),
    }
}

struct Listener<E> {
    id: ListenerId,
    filter: Filter,
    tx: mpsc::UnboundedSender<E>,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<String, Vec<Listener<ResourceEvent>>>,
    clients: HashMap<String, Vec<Listener<ClientEvent>>>,
}

/// The event bus: fans out resource and client events to registered
/// listeners, addressed by namespaced subject.
///
/// Resource events are emitted at `<namespace>.resource.<rid>`, client
/// events at `<namespace>`. A bus may be shared between clients (pass it
/// via the builder); distinct namespaces keep their events apart.
///
/// Emission never blocks: each listener is an unbounded channel, and
/// listeners whose receiving end was dropped are pruned on the next
/// emission to their subject.
pub struct EventBus {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), inner: Mutex::new(Inner::default()) }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a listener for resource events on `subject`, optionally
    /// filtered to a comma-separated list of event names.
    pub fn subscribe_resource(
        &self,
        subject: &str,
        filter: Option<&str>,
    ) -> (ListenerId, mpsc::UnboundedReceiver<ResourceEvent>) {
        let (tx, rx) = mpsc::unbounded();
        let id = self.next_id();
        let listener = Listener { id, filter: parse_filter(filter), tx };
        self.inner.lock().unwrap().resources.entry(subject.to_owned()).or_default().push(listener);
        (id, rx)
    }

    /// Removes a resource listener. Returns false if it was not found.
    pub fn unsubscribe_resource(&self, subject: &str, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.resources.get_mut(subject) {
            Some(listeners) => {
                let before = listeners.len();
                listeners.retain(|l| l.id != id);
                let found = listeners.len() < before;
                if listeners.is_empty() {
                    inner.resources.remove(subject);
                }
                found
            }
            None => false,
        }
    }

    /// Registers a listener for client events on `subject` (the
    /// namespace), optionally filtered.
    pub fn subscribe_client(
        &self,
        subject: &str,
        filter: Option<&str>,
    ) -> (ListenerId, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded();
        let id = self.next_id();
        let listener = Listener { id, filter: parse_filter(filter), tx };
        self.inner.lock().unwrap().clients.entry(subject.to_owned()).or_default().push(listener);
        (id, rx)
    }

    /// Removes a client listener. Returns false if it was not found.
    pub fn unsubscribe_client(&self, subject: &str, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.clients.get_mut(subject) {
            Some(listeners) => {
                let before = listeners.len();
                listeners.retain(|l| l.id != id);
                let found = listeners.len() < before;
                if listeners.is_empty() {
                    inner.clients.remove(subject);
                }
                found
            }
            None => false,
        }
    }

    /// Emits a resource event to every matching listener on `subject`.
    pub fn emit_resource(&self, subject: &str, event: &ResourceEvent) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(listeners) = inner.resources.get_mut(subject) {
            listeners.retain(|l| {
                if !filter_matches(&l.filter, event.name()) {
                    return !l.tx.is_closed();
                }
                l.tx.unbounded_send(event.clone()).is_ok()
            });
            if listeners.is_empty() {
                inner.resources.remove(subject);
            }
        }
    }

    /// Emits a client event to every matching listener on `subject`.
    pub fn emit_client(&self, subject: &str, event: &ClientEvent) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(listeners) = inner.clients.get_mut(subject) {
            listeners.retain(|l| {
                if !filter_matches(&l.filter, event.name()) {
                    return !l.tx.is_closed();
                }
                l.tx.unbounded_send(event.clone()).is_ok()
            });
            if listeners.is_empty() {
                inner.clients.remove(subject);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// The subject resource events for `rid` are emitted at.
pub(crate) fn resource_subject(namespace: &str, rid: &resclient_core::Rid) -> String {
    format!("{namespace}.resource.{rid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_delivery() {
        let bus = EventBus::new();
        let (_all, mut rx_all) = bus.subscribe_resource("ns.resource.x.a", None);
        let (_some, mut rx_some) = bus.subscribe_resource("ns.resource.x.a", Some("unsubscribe"));

        bus.emit_resource("ns.resource.x.a", &ResourceEvent::Unsubscribe);
        bus.emit_resource(
            "ns.resource.x.a",
            &ResourceEvent::Custom { name: "ping".to_owned(), data: None },
        );
        bus.emit_resource("ns.resource.x.b", &ResourceEvent::Unsubscribe);

        assert!(matches!(rx_all.try_next().unwrap().unwrap(), ResourceEvent::Unsubscribe));
        assert!(matches!(rx_all.try_next().unwrap().unwrap(), ResourceEvent::Custom { .. }));
        assert!(matches!(rx_some.try_next().unwrap().unwrap(), ResourceEvent::Unsubscribe));
        assert!(rx_some.try_next().is_err());
    }

    #[test]
    fn unsubscribe_listener() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe_client("ns", None);
        assert!(bus.unsubscribe_client("ns", id));
        assert!(!bus.unsubscribe_client("ns", id));
        bus.emit_client("ns", &ClientEvent::Connect);
        assert!(rx.try_next().unwrap().is_none());
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe_resource("ns.resource.x.a", None);
        drop(rx);
        bus.emit_resource("ns.resource.x.a", &ResourceEvent::Unsubscribe);
        // listener table is empty again; unsubscribing is a no-op
        assert!(!bus.unsubscribe_resource("ns.resource.x.a", _id));
    }
}
