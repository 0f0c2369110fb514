//! Listener registry and dispatch.
//!
//! # Design
//! - Registrations live in a per-category table guarded by a std mutex; the
//!   lock is never held while callbacks run, so callbacks may register or
//!   unregister freely.
//! - Each publish round works on a snapshot taken under the lock. Removal
//!   during a round neither skips nor double-invokes siblings; additions only
//!   see later rounds.
//! - Callback panics are caught per listener and recorded as
//!   [`ListenerFailure`]s.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error};

use crate::error::ListenerFailure;
use crate::payloads::{DEFAULT_TAP_CAPACITY, Event, EventCategory, EventEnvelope, EventStream};

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Opaque registration handle returned by [`ListenerBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    id: u64,
    category: EventCategory,
}

impl ListenerHandle {
    /// Category the registration belongs to.
    #[must_use]
    pub const fn category(&self) -> EventCategory {
        self.category
    }
}

/// Outcome of a single publish round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Callbacks that returned normally.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub failed: Vec<ListenerFailure>,
}

struct Registration {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    table: HashMap<EventCategory, Vec<Registration>>,
}

/// Typed publish/subscribe registry shared by the engine and its observers.
#[derive(Clone)]
pub struct ListenerBus {
    registry: Arc<Mutex<Registry>>,
    next_listener: Arc<AtomicU64>,
    next_event: Arc<AtomicU64>,
    tap: broadcast::Sender<EventEnvelope>,
}

impl ListenerBus {
    /// Construct a bus with the default tap capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tap_capacity(DEFAULT_TAP_CAPACITY)
    }

    /// Construct a bus whose async tap buffers `capacity` envelopes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_tap_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "listener bus tap capacity must be positive");
        let (tap, _) = broadcast::channel(capacity);
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            next_listener: Arc::new(AtomicU64::new(1)),
            next_event: Arc::new(AtomicU64::new(1)),
            tap,
        }
    }

    /// Register `callback` for every event in `category`.
    pub fn register<F>(&self, category: EventCategory, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.lock_registry()
            .table
            .entry(category)
            .or_default()
            .push(Registration {
                id,
                callback: Arc::new(callback),
            });
        debug!(listener = id, category = category.as_str(), "listener registered");
        ListenerHandle { id, category }
    }

    /// Remove a registration. Returns `false` when it was already removed.
    pub fn unregister(&self, handle: ListenerHandle) -> bool {
        let mut registry = self.lock_registry();
        let Some(slots) = registry.table.get_mut(&handle.category) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|registration| registration.id != handle.id);
        let removed = slots.len() != before;
        drop(registry);
        if removed {
            debug!(
                listener = handle.id,
                category = handle.category.as_str(),
                "listener unregistered"
            );
        }
        removed
    }

    /// Number of live registrations for `category`.
    #[must_use]
    pub fn listener_count(&self, category: EventCategory) -> usize {
        self.lock_registry().table.get(&category).map_or(0, Vec::len)
    }

    /// Deliver `event` to every listener registered for its category.
    ///
    /// Delivery runs on the calling thread in registration order. The
    /// envelope is also offered to async tap subscribers.
    pub fn publish(&self, event: &Event) -> PublishReport {
        let category = event.category();
        let snapshot: Vec<(u64, Callback)> = self
            .lock_registry()
            .table
            .get(&category)
            .map(|slots| {
                slots
                    .iter()
                    .map(|registration| (registration.id, Arc::clone(&registration.callback)))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for (listener, callback) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => report.delivered += 1,
                Err(payload) => {
                    let failure = ListenerFailure::from_panic(listener, category, payload.as_ref());
                    error!(
                        listener,
                        category = category.as_str(),
                        message = %failure.message,
                        "event listener panicked"
                    );
                    report.failed.push(failure);
                }
            }
        }

        let envelope = EventEnvelope {
            id: self.next_event.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            event: event.clone(),
        };
        let _ = self.tap.send(envelope);
        report
    }

    /// Attach an async tap that observes every published event.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.tap.subscribe())
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ListenerBus {
    fn default() -> Self {
        Self::new()
    }
}
