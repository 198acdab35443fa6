//! Bus adapter: the seam to the underlying publish/subscribe transport.
//!
//! The transport itself is an external collaborator; [`Bus`] is the
//! contract the registry and the handles program against, and [`LocalBus`]
//! is the in-process implementation used for single-machine wiring and
//! tests. Publish is non-blocking for the caller; delivery happens on a
//! dispatcher task, so handlers run on a different call stack than the
//! subscription site and must synchronize any shared state themselves.
//!
//! The shared connection is ref-counted through [`BusContext`]: the first
//! acquisition connects, later ones share, and release tears the real
//! connection down on the last reference. The context is an explicitly
//! passed object, not process-global state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use mediactl_types::Error;

use crate::signal::{SignalMessage, SignalName, SignalPayload};

/// Callback invoked with each delivered signal.
pub type SignalHandler = Arc<dyn Fn(&SignalMessage) + Send + Sync>;

/// Opaque handle to one bus subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Abstract publish/subscribe bus delivering named signals on named
/// interfaces to all subscribers.
pub trait Bus: Send + Sync {
    /// Register interest in `(interface, signal)`.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on an empty interface name, `InvalidOperation`
    /// when the connection is gone.
    fn subscribe(
        &self,
        interface: &str,
        signal: SignalName,
        handler: SignalHandler,
    ) -> Result<SubscriptionId, Error>;

    /// Drop a subscription. After this returns, the handler is no longer
    /// reachable from the dispatch path.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for an unknown id.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Error>;

    /// Queue one signal for delivery to every matching subscriber.
    /// Fire-and-forget from the caller's perspective.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on an empty interface, `InvalidOperation` when
    /// the connection is gone.
    fn publish(
        &self,
        interface: &str,
        signal: SignalName,
        payload: &SignalPayload,
    ) -> Result<(), Error>;
}

struct Route {
    interface: String,
    signal: SignalName,
    handler: SignalHandler,
}

#[derive(Default)]
struct RouteTable {
    next_id: u64,
    routes: HashMap<u64, Route>,
}

/// In-process bus: a routing table plus one dispatcher task draining an
/// unbounded queue, which preserves per-topic publish order.
pub struct LocalBus {
    routes: Mutex<RouteTable>,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

impl LocalBus {
    /// Connect the in-process bus and start its dispatcher task.
    ///
    /// Must be called from within a tokio runtime. The dispatcher exits
    /// when the last handle to the bus is dropped.
    #[must_use]
    pub fn connect() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();
        let bus = Arc::new(Self {
            routes: Mutex::new(RouteTable::default()),
            tx,
        });

        let weak: Weak<LocalBus> = Arc::downgrade(&bus);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(bus) = weak.upgrade() else {
                    break;
                };
                bus.dispatch(&message);
            }
            trace!("bus dispatcher stopped");
        });

        bus
    }

    /// Deliver one message to every handler matching its interface+signal.
    /// Handlers are cloned out of the lock before invocation so a callback
    /// may re-enter the bus.
    fn dispatch(&self, message: &SignalMessage) {
        let handlers: Vec<SignalHandler> = {
            let table = lock_routes(&self.routes);
            table
                .routes
                .values()
                .filter(|r| r.interface == message.interface && r.signal == message.signal)
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };

        trace!(
            interface = %message.interface,
            signal = %message.signal,
            matches = handlers.len(),
            "dispatching signal"
        );

        for handler in handlers {
            handler(message);
        }
    }
}

fn lock_routes(routes: &Mutex<RouteTable>) -> std::sync::MutexGuard<'_, RouteTable> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Bus for LocalBus {
    fn subscribe(
        &self,
        interface: &str,
        signal: SignalName,
        handler: SignalHandler,
    ) -> Result<SubscriptionId, Error> {
        if interface.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let mut table = lock_routes(&self.routes);
        let id = table.next_id;
        table.next_id += 1;
        table.routes.insert(
            id,
            Route {
                interface: interface.to_string(),
                signal,
                handler,
            },
        );
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Error> {
        let mut table = lock_routes(&self.routes);
        if table.routes.remove(&id.0).is_none() {
            warn!(id = id.0, "unsubscribe of unknown subscription");
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    fn publish(
        &self,
        interface: &str,
        signal: SignalName,
        payload: &SignalPayload,
    ) -> Result<(), Error> {
        if interface.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let message = SignalMessage {
            interface: interface.to_string(),
            signal,
            payload: payload.clone(),
        };
        self.tx.send(message).map_err(|_| Error::InvalidOperation)
    }
}

struct ContextInner {
    bus: Option<Arc<LocalBus>>,
    refs: u32,
}

/// Owner of the shared bus connection and its reference count.
///
/// One per process; passed explicitly to everything that needs the bus.
/// Concurrent acquire/release are serialized by the internal mutex.
pub struct BusContext {
    inner: Mutex<ContextInner>,
}

impl BusContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ContextInner { bus: None, refs: 0 }),
        }
    }

    /// Acquire the shared connection. The first acquisition performs the
    /// actual connect; subsequent ones increment the reference count.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the connection cannot be established.
    pub fn acquire(&self) -> Result<Arc<LocalBus>, Error> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(bus) = &inner.bus {
            let bus = Arc::clone(bus);
            inner.refs += 1;
            debug!(refs = inner.refs, "bus reference acquired");
            return Ok(bus);
        }

        let bus = LocalBus::connect();
        inner.bus = Some(Arc::clone(&bus));
        inner.refs = 1;
        debug!("bus connected");
        Ok(bus)
    }

    /// Release one reference; the real connection is torn down when the
    /// count reaches zero.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` on a release without a matching acquire.
    pub fn release(&self) -> Result<(), Error> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if inner.refs == 0 {
            warn!("bus release without acquire");
            return Err(Error::InvalidOperation);
        }

        inner.refs -= 1;
        debug!(refs = inner.refs, "bus reference released");
        if inner.refs == 0 {
            inner.bus = None;
        }
        Ok(())
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refs
    }
}

impl Default for BusContext {
    fn default() -> Self {
        Self::new()
    }
}
