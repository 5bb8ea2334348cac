//! Observer bus (§4.2 `subscribe`, §4.4.8). A panicking listener must not
//! prevent other listeners from observing the same event, nor propagate out
//! of the emitting call — mirrors the "listener throws are isolated per
//! listener" contract from §4.4.8.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Every event type named in §4.2 and §4.4.8.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    MutationAdded {
        mutation_id: i64,
        entity: String,
        entity_id: String,
        pending_count: i64,
    },
    MutationCompleted {
        mutation_id: i64,
        entity: String,
        entity_id: String,
        pending_count: i64,
    },
    MutationFailed {
        mutation_id: i64,
        entity: String,
        entity_id: String,
        pending_count: i64,
        error_message: String,
    },
    MutationRemoved {
        mutation_id: i64,
        pending_count: i64,
    },
    MutationsCleanup {
        removed_count: usize,
        pending_count: i64,
    },
    MutationsReset {
        reset_count: usize,
        pending_count: i64,
    },

    SyncStart {
        correlation_id: String,
    },
    SyncComplete {
        correlation_id: String,
    },
    SyncError {
        correlation_id: String,
        message: String,
    },
    SyncRetry {
        correlation_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    SyncMaxRetriesExceeded {
        correlation_id: String,
    },
    EntitySyncStart {
        correlation_id: String,
        entity: String,
    },
    EntitySyncComplete {
        correlation_id: String,
        entity: String,
        pulled: usize,
        pushed: usize,
    },
    MutationPushed {
        correlation_id: String,
        entity: String,
        mutation_id: i64,
    },
    MutationsBatchComplete {
        correlation_id: String,
        entity: String,
        count: usize,
    },
    ConflictResolved {
        entity: String,
        entity_id: String,
    },
    OfflineDetected,
    OnlineDetected,
    PushOnlyStart {
        correlation_id: String,
    },
    PushOnlyComplete {
        correlation_id: String,
        pushed: usize,
    },
    PushOnlyError {
        correlation_id: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmittedEvent {
    pub event: SyncEvent,
    pub at: DateTime<Utc>,
}

type Listener = Arc<dyn Fn(&EmittedEvent) + Send + Sync>;

/// An id returned by `subscribe` that unsubscribes the listener on drop.
pub struct Subscription {
    id: u64,
    bus: Arc<EventBusInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

struct EventBusInner {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl EventBusInner {
    fn unsubscribe(&self, id: u64) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(listener_id, _)| *listener_id != id);
    }
}

/// Observer registry for one component's event stream.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a listener. Dropping the returned `Subscription` unsubscribes.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EmittedEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Emits an event to every subscriber. Best-effort: a panicking listener
    /// is caught and logged, never prevents the remaining listeners from
    /// running and never propagates to the caller.
    pub fn emit(&self, event: SyncEvent) {
        let emitted = EmittedEvent {
            event,
            at: Utc::now(),
        };
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (_, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&emitted))).is_err() {
                log::warn!("sync event listener panicked; isolated, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn all_listeners_invoked_even_if_one_panics() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let _sub1 = bus.subscribe(|_event| {
            panic!("boom");
        });
        let calls_clone = Arc::clone(&calls);
        let _sub2 = bus.subscribe(move |_event| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SyncEvent::OfflineDetected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_subscription_stops_receiving_events() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let sub = bus.subscribe(move |_event| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(SyncEvent::OnlineDetected);
        drop(sub);
        bus.emit(SyncEvent::OnlineDetected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
