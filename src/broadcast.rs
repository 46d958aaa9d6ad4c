//! Membership sets that are read far more often than they change.
//!
//! A [`Registry`] keeps its members in an immutable `Arc<Vec<_>>`. Adding or
//! removing a member builds a new vector and swaps it in, so a dispatch that
//! took a [`Registry::snapshot`] iterates a stable list without holding any
//! lock, and registrations made during that dispatch only affect later ones.
//!
//! Members are compared by identity (`Arc` pointer), never by value.

use crate::listener::{deliver, Delivery, Listener};
use crate::source_event::{SourceEvent, SourceEventProvider};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

fn identity<M: ?Sized>(member: &Arc<M>) -> usize {
    Arc::as_ptr(member) as *const () as usize
}

/// Copy-on-write set of shared members.
pub struct Registry<M: ?Sized> {
    members: RwLock<Arc<Vec<Arc<M>>>>,
}

impl<M: ?Sized> Default for Registry<M> {
    fn default() -> Self {
        Self {
            members: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<M: ?Sized> fmt::Debug for Registry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

impl<M: ?Sized> Registry<M> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `member`. Returns `false` if that exact member is already present.
    pub fn add(&self, member: Arc<M>) -> bool {
        let mut members = self.members.write();
        let id = identity(&member);
        if members.iter().any(|m| identity(m) == id) {
            return false;
        }
        let mut next = Vec::with_capacity(members.len() + 1);
        next.extend(members.iter().cloned());
        next.push(member);
        *members = Arc::new(next);
        true
    }

    /// Remove `member`. Returns `false` if it was not present.
    pub fn remove(&self, member: &Arc<M>) -> bool {
        let mut members = self.members.write();
        let id = identity(member);
        if !members.iter().any(|m| identity(m) == id) {
            return false;
        }
        let next: Vec<Arc<M>> = members
            .iter()
            .filter(|m| identity(m) != id)
            .cloned()
            .collect();
        *members = Arc::new(next);
        true
    }

    /// Whether `member` is registered.
    pub fn contains(&self, member: &Arc<M>) -> bool {
        let id = identity(member);
        self.members.read().iter().any(|m| identity(m) == id)
    }

    /// Current members, in registration order.
    pub fn snapshot(&self) -> Arc<Vec<Arc<M>>> {
        Arc::clone(&self.members.read())
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Whether there are no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every member.
    pub fn clear(&self) {
        *self.members.write() = Arc::new(Vec::new());
    }
}

/// Fans one item out to every registered [`Listener`].
///
/// A listener that errors or panics is logged and skipped; the others still
/// receive the item. Listeners are never unregistered because they fail.
pub struct Broadcaster<T> {
    listeners: Registry<dyn Listener<T>>,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self {
            listeners: Registry::new(),
        }
    }
}

impl<T> fmt::Debug for Broadcaster<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<T: Clone> Broadcaster<T> {
    /// Broadcaster with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns `false` if it was already registered.
    pub fn add_listener(&self, listener: Arc<dyn Listener<T>>) -> bool {
        self.listeners.add(listener)
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn Listener<T>>) -> bool {
        self.listeners.remove(listener)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.listeners.clear();
    }

    /// Deliver `item` to the current listeners. Returns how many accepted it.
    pub fn broadcast(&self, item: T) -> usize {
        let listeners = self.listeners.snapshot();
        let mut delivered = 0;
        for listener in listeners.iter() {
            match deliver(listener.as_ref(), item.clone()) {
                Delivery::Delivered => delivered += 1,
                Delivery::Failed(message) => {
                    error!(error = %message, "Error while broadcasting to listener");
                }
                Delivery::Panicked(message) => {
                    error!(panic = %message, "Listener panicked during broadcast");
                }
            }
        }
        delivered
    }
}

impl<T: Clone + Send + Sync> Listener<T> for Broadcaster<T> {
    fn receive(&self, item: T) -> anyhow::Result<()> {
        self.broadcast(item);
        Ok(())
    }
}

/// Consumer registry with a mirrored [`SourceEvent`] broadcaster.
///
/// Each consumer supplies its own event listener. Adding a consumer also
/// registers that listener; removing the consumer unregisters the very
/// listener captured when it was added, so the two sets never drift apart
/// even if the consumer would hand out a different listener today.
///
/// Consumers may share one listener. It stays registered, and receives each
/// event once, until the last consumer using it is removed.
pub struct ChannelRegistry<C: ?Sized> {
    consumers: Registry<C>,
    events: Broadcaster<SourceEvent>,
    // Also serializes add/remove so both sets change together.
    registrations: Mutex<Registrations>,
}

#[derive(Default)]
struct Registrations {
    // consumer identity -> listener captured at registration
    by_consumer: HashMap<usize, Arc<dyn Listener<SourceEvent>>>,
    // listener identity -> consumers currently using it
    users: HashMap<usize, usize>,
}

impl<C: ?Sized> Default for ChannelRegistry<C> {
    fn default() -> Self {
        Self {
            consumers: Registry::new(),
            events: Broadcaster::new(),
            registrations: Mutex::new(Registrations::default()),
        }
    }
}

impl<C: ?Sized> fmt::Debug for ChannelRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("consumers", &self.consumers.len())
            .field("event_listeners", &self.events.listener_count())
            .finish()
    }
}

impl<C: SourceEventProvider + ?Sized> ChannelRegistry<C> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` and its event listener.
    ///
    /// Returns `false` and changes nothing if the consumer is already present.
    pub fn add(&self, consumer: Arc<C>) -> bool {
        self.register(consumer, None)
    }

    /// Register `consumer` after handing `initial` to its event listener.
    ///
    /// The event reaches the listener before the consumer can see any data or
    /// later broadcast. A listener that rejects it is logged and registered
    /// anyway. The listener must not call back into this registry.
    pub fn add_announced(&self, consumer: Arc<C>, initial: SourceEvent) -> bool {
        self.register(consumer, Some(initial))
    }

    fn register(&self, consumer: Arc<C>, initial: Option<SourceEvent>) -> bool {
        let mut guard = self.registrations.lock();
        let registrations = &mut *guard;
        let id = identity(&consumer);
        if registrations.by_consumer.contains_key(&id) {
            return false;
        }
        let listener = consumer.source_event_listener();

        if let Some(event) = initial {
            match deliver(listener.as_ref(), event) {
                Delivery::Delivered => {}
                Delivery::Failed(message) => {
                    error!(error = %message, "Channel consumer rejected initial event");
                }
                Delivery::Panicked(message) => {
                    error!(panic = %message, "Channel consumer panicked on initial event");
                }
            }
        }

        let users = registrations.users.entry(identity(&listener)).or_insert(0);
        if *users == 0 {
            self.events.add_listener(Arc::clone(&listener));
        }
        *users += 1;
        registrations.by_consumer.insert(id, listener);
        self.consumers.add(consumer);
        debug!(consumers = self.consumers.len(), "Channel consumer registered");
        true
    }

    /// Unregister `consumer` and, once no other consumer shares it, the event
    /// listener captured when it was added. Returns `false` if it was not
    /// registered.
    pub fn remove(&self, consumer: &Arc<C>) -> bool {
        let mut guard = self.registrations.lock();
        let registrations = &mut *guard;
        let Some(listener) = registrations.by_consumer.remove(&identity(consumer)) else {
            return false;
        };
        self.consumers.remove(consumer);

        let key = identity(&listener);
        let remaining = match registrations.users.get_mut(&key) {
            Some(users) => {
                *users = users.saturating_sub(1);
                *users
            }
            None => 0,
        };
        if remaining == 0 {
            registrations.users.remove(&key);
            self.events.remove_listener(&listener);
        }
        debug!(consumers = self.consumers.len(), "Channel consumer removed");
        true
    }

    /// The event listener captured when `consumer` was added.
    pub fn event_listener(&self, consumer: &Arc<C>) -> Option<Arc<dyn Listener<SourceEvent>>> {
        self.registrations
            .lock()
            .by_consumer
            .get(&identity(consumer))
            .cloned()
    }

    /// Whether `consumer` is registered.
    pub fn contains(&self, consumer: &Arc<C>) -> bool {
        self.consumers.contains(consumer)
    }

    /// Current consumers, in registration order.
    pub fn consumers(&self) -> Arc<Vec<Arc<C>>> {
        self.consumers.snapshot()
    }

    /// Number of consumers.
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    /// Whether there are no consumers.
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Number of distinct event listeners. Consumers sharing a listener
    /// count it once.
    pub fn event_listener_count(&self) -> usize {
        self.events.listener_count()
    }

    /// Deliver `event` to every registered event listener.
    pub fn broadcast_event(&self, event: SourceEvent) -> usize {
        self.events.broadcast(event)
    }
}
