//! Subscription registry: active listeners keyed by (interface, signal).
//!
//! One registry per handle. At most one listener may exist per key; a
//! duplicate registration is rejected, not merged. Unregistration removes
//! the listener from the table and unsubscribes it from the bus before
//! returning, so no later delivery can reach it.
//!
//! Filtered registrations narrow a broadcast topic to a single peer: the
//! derived per-peer interface is registered like any other listener and its
//! name is recorded in an ordered [`FilterList`] so it can be torn down or
//! enumerated later.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, warn};

use mediactl_types::Error;

use crate::bus::{Bus, SignalHandler, SubscriptionId};
use crate::names;
use crate::signal::{SignalMessage, SignalName};

/// Structured listener key; no concatenated strings, no delimiter pitfalls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SignalKey {
    interface: String,
    signal: SignalName,
}

impl SignalKey {
    fn of(message: &SignalMessage) -> Self {
        Self {
            interface: message.interface.clone(),
            signal: message.signal,
        }
    }
}

struct ListenerEntry {
    subscription: SubscriptionId,
    handler: SignalHandler,
}

type ListenerMap = HashMap<SignalKey, ListenerEntry>;

/// Registry of active listeners for one handle.
pub struct ListenerRegistry {
    inner: Arc<Mutex<ListenerMap>>,
}

fn lock(map: &Mutex<ListenerMap>) -> std::sync::MutexGuard<'_, ListenerMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The single demultiplexing point: compute the key of the delivered
/// signal, look up the exact match, and invoke its callback. The handler is
/// cloned out of the lock first so callbacks may re-enter the registry.
fn dispatch_message(registry: &Weak<Mutex<ListenerMap>>, message: &SignalMessage) {
    let Some(map) = registry.upgrade() else {
        return;
    };

    let handler = {
        let map = lock(&map);
        map.get(&SignalKey::of(message))
            .map(|entry| Arc::clone(&entry.handler))
    };

    if let Some(handler) = handler {
        handler(message);
    }
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a listener for `(interface, signal)`.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on an empty interface or when a listener with the
    /// same key already exists; in both cases the table is unchanged and
    /// the bus sees no side effect.
    pub fn register(
        &self,
        bus: &dyn Bus,
        interface: &str,
        signal: SignalName,
        handler: SignalHandler,
    ) -> Result<(), Error> {
        if interface.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let key = SignalKey {
            interface: interface.to_string(),
            signal,
        };

        let mut map = lock(&self.inner);
        if map.contains_key(&key) {
            warn!(interface, signal = %signal, "listener already registered");
            return Err(Error::InvalidParameter);
        }

        let weak = Arc::downgrade(&self.inner);
        let dispatch: SignalHandler =
            Arc::new(move |message| dispatch_message(&weak, message));
        let subscription = bus.subscribe(interface, signal, dispatch)?;

        map.insert(
            key,
            ListenerEntry {
                subscription,
                handler,
            },
        );
        debug!(interface, signal = %signal, "listener registered");
        Ok(())
    }

    /// Remove the listener for `(interface, signal)` and unsubscribe it
    /// from the bus. A missing listener is a successful no-op.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on an empty interface; bus failures propagate.
    pub fn unregister(
        &self,
        bus: &dyn Bus,
        interface: &str,
        signal: SignalName,
    ) -> Result<(), Error> {
        if interface.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let key = SignalKey {
            interface: interface.to_string(),
            signal,
        };

        let removed = lock(&self.inner).remove(&key);
        let Some(entry) = removed else {
            return Ok(());
        };

        bus.unsubscribe(entry.subscription)?;
        debug!(interface, signal = %signal, "listener unregistered");
        Ok(())
    }

    /// Tear down every listener. Every unsubscribe is attempted even if an
    /// earlier one failed; the last failure is reported.
    ///
    /// # Errors
    ///
    /// The last bus failure observed, if any.
    pub fn unregister_all(&self, bus: &dyn Bus) -> Result<(), Error> {
        let drained: Vec<(SignalKey, ListenerEntry)> =
            lock(&self.inner).drain().collect();

        let mut last_error = None;
        for (key, entry) in drained {
            if let Err(e) = bus.unsubscribe(entry.subscription) {
                warn!(interface = %key.interface, signal = %key.signal, error = %e, "unsubscribe failed during teardown");
                last_error = Some(e);
            }
        }

        last_error.map_or(Ok(()), Err)
    }

    /// Register a listener scoped to one peer: the interface is derived
    /// from `base_interface` and `peer`, and on success the derived name is
    /// appended to `filters`.
    ///
    /// # Errors
    ///
    /// Name-derivation and registration failures propagate; `filters` is
    /// only extended on success.
    pub fn register_filtered(
        &self,
        bus: &dyn Bus,
        filters: &mut FilterList,
        base_interface: &str,
        peer: &str,
        signal: SignalName,
        handler: SignalHandler,
    ) -> Result<(), Error> {
        let interface = names::filter_interface_name(base_interface, peer)?;
        self.register(bus, &interface, signal, handler)?;
        filters.names.push(interface);
        Ok(())
    }

    /// Remove filtered listeners.
    ///
    /// With a peer, only that peer's subscription and filter entry are
    /// removed. Without one, every entry in `filters` is unregistered and
    /// the list is cleared (bulk teardown), attempting every entry and
    /// reporting the last failure.
    ///
    /// # Errors
    ///
    /// Name-derivation and bus failures propagate.
    pub fn unregister_filtered(
        &self,
        bus: &dyn Bus,
        filters: &mut FilterList,
        base_interface: &str,
        peer: Option<&str>,
        signal: SignalName,
    ) -> Result<(), Error> {
        if let Some(peer) = peer {
            let interface = names::filter_interface_name(base_interface, peer)?;
            self.unregister(bus, &interface, signal)?;
            filters.names.retain(|name| name != &interface);
            return Ok(());
        }

        let mut last_error = None;
        for interface in filters.names.drain(..) {
            if let Err(e) = self.unregister(bus, &interface, signal) {
                warn!(interface, error = %e, "filtered unregister failed during teardown");
                last_error = Some(e);
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    /// Number of active listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Whether a listener for `(interface, signal)` is active.
    #[must_use]
    pub fn contains(&self, interface: &str, signal: SignalName) -> bool {
        lock(&self.inner).contains_key(&SignalKey {
            interface: interface.to_string(),
            signal,
        })
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered list of per-peer filter interface names for one topic.
#[derive(Debug, Default)]
pub struct FilterList {
    names: Vec<String>,
}

impl FilterList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Visit the peer identity behind each filter entry, in registration
    /// order. The callback returning `false` stops the iteration early.
    /// Entries whose name does not parse back against `base_interface` are
    /// skipped.
    pub fn foreach_peer(&self, base_interface: &str, mut callback: impl FnMut(&str) -> bool) {
        for name in &self.names {
            let Some(peer) = names::peer_from_filter_name(base_interface, name) else {
                continue;
            };
            if !callback(peer) {
                break;
            }
        }
    }
}
