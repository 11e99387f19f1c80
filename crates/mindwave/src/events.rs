//! # Event Bus
//!
//! A small typed publish/subscribe registry shared by the
//! [`Connector`](crate::Connector) and the [`Session`](crate::Session).
//!
//! Events implement [`BusEvent`], which maps each event to a *kind*.
//! Handlers subscribe to a single kind (or to every kind with
//! [`EventBus::subscribe_all`]) and are invoked synchronously on the
//! publishing task, in registration order.
//!
//! ```text
//! publish(event) ──► snapshot of handlers (lock held only for the copy)
//!                      │
//!                      ├─► handler #1 ── panics? ──► logged, counted, skipped
//!                      ├─► handler #2
//!                      └─► handler #n
//! ```
//!
//! Because dispatch runs over a snapshot, a handler may subscribe or detach
//! other handlers (or itself) while an event is being delivered. Changes
//! apply to the next `publish`.
//!
//! Handlers must be fast and must not block. Slow work belongs on another
//! task; forward the event through a channel instead.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// An event that can travel over an [`EventBus`].
pub trait BusEvent: Send + Sync + 'static {
    /// Discriminant used to route the event to subscribers.
    type Kind: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    /// The kind of this event.
    fn kind(&self) -> Self::Kind;
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E: BusEvent> {
    id: u64,
    /// `None` matches every kind.
    filter: Option<E::Kind>,
    handler: Handler<E>,
}

struct Registry<E: BusEvent> {
    next_id: u64,
    entries: Vec<Entry<E>>,
}

/// Outcome of a single [`EventBus::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that returned normally.
    pub delivered: usize,
    /// Handlers that panicked. Their failure did not affect the others.
    pub failed: usize,
}

impl DispatchReport {
    /// `true` when no handler failed.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Typed, multi-producer multi-consumer handler registry.
///
/// Cloning an `EventBus` yields another handle to the same registry.
pub struct EventBus<E: BusEvent> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.len())
            .finish()
    }
}

impl<E: BusEvent> EventBus<E> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    /// Register `handler` for events of `kind`.
    ///
    /// The returned [`Subscription`] detaches the handler. Dropping the
    /// subscription without calling [`Subscription::detach`] leaves the
    /// handler registered for the lifetime of the bus.
    pub fn subscribe<F>(&self, kind: E::Kind, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register `handler` for every event published on this bus.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, filter: Option<E::Kind>, handler: Handler<E>) -> Subscription {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push(Entry {
                id,
                filter,
                handler,
            });
            id
        };

        tracing::trace!(subscription = id, kind = ?filter, "Handler registered");

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        let registry: Weak<dyn Detach> = weak;
        Subscription {
            id,
            registry,
            detached: AtomicBool::new(false),
        }
    }

    /// Deliver `event` to every matching handler, in registration order.
    ///
    /// A handler that panics is isolated: the panic is logged and counted in
    /// the returned [`DispatchReport`], and the remaining handlers still run.
    pub fn publish(&self, event: &E) -> DispatchReport {
        let kind = event.kind();
        let snapshot: Vec<(u64, Handler<E>)> = {
            let registry = lock(&self.registry);
            registry
                .entries
                .iter()
                .filter(|entry| entry.filter.is_none_or(|k| k == kind))
                .map(|entry| (entry.id, Arc::clone(&entry.handler)))
                .collect()
        };

        let mut report = DispatchReport::default();
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => report.delivered += 1,
                Err(payload) => {
                    report.failed += 1;
                    tracing::error!(
                        subscription = id,
                        kind = ?kind,
                        panic = %panic_message(payload.as_ref()),
                        "Event handler panicked; continuing dispatch"
                    );
                }
            }
        }
        report
    }

    /// Number of handlers that would receive an event of `kind`.
    pub fn handler_count(&self, kind: E::Kind) -> usize {
        lock(&self.registry)
            .entries
            .iter()
            .filter(|entry| entry.filter.is_none_or(|k| k == kind))
            .count()
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    /// `true` when no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Type-erased removal so [`Subscription`] does not carry the event type.
trait Detach: Send + Sync {
    fn remove(&self, id: u64) -> bool;
    fn contains(&self, id: u64) -> bool;
}

impl<E: BusEvent> Detach for Mutex<Registry<E>> {
    fn remove(&self, id: u64) -> bool {
        let mut registry = lock(self);
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != id);
        registry.entries.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        lock(self).entries.iter().any(|entry| entry.id == id)
    }
}

/// Handle to one registered handler.
///
/// [`detach`](Self::detach) unregisters the handler and releases the bus's
/// reference to it. Detaching more than once is a no-op.
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Detach>,
    detached: AtomicBool,
}

impl Subscription {
    /// Unregister the handler. Safe to call repeatedly, from any thread,
    /// including from inside a handler during dispatch.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                tracing::trace!(subscription = self.id, "Handler detached");
            }
        }
    }

    /// `true` while the handler is still registered on a live bus.
    pub fn is_attached(&self) -> bool {
        if self.detached.load(Ordering::SeqCst) {
            return false;
        }
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.contains(self.id))
    }

    /// Numeric identifier of this subscription (unique per bus).
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.is_attached())
            .finish()
    }
}
