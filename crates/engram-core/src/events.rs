//! In-process event bus.
//!
//! Writes bump a global epoch (read by the query cache) and deliver typed
//! [`MemoryEvent`]s to subscribers synchronously. A panicking subscriber is
//! logged and isolated; it never propagates to the writer.

use crate::model::MemoryEvent;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, warn};

type Subscriber = Box<dyn Fn(&MemoryEvent) + Send + Sync>;

/// Shared bus; cheap to clone behind an `Arc`.
pub struct EventBus {
    epoch: AtomicU64,
    subscribers: RwLock<Vec<(String, Subscriber)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Current invalidation epoch. Part of every query cache key.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Advance the epoch, invalidating all cached query results at once.
    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Register a named subscriber. The name only shows up in logs.
    pub fn subscribe(&self, name: impl Into<String>, f: impl Fn(&MemoryEvent) + Send + Sync + 'static) {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push((name.into(), Box::new(f)));
    }

    /// Deliver an event to every subscriber, in registration order. Query
    /// invalidation happens first so no subscriber can observe a stale cache.
    pub fn emit(&self, event: &MemoryEvent) {
        if event.invalidates_queries() {
            self.bump_epoch();
        }
        debug!(action = event.action(), "event");
        let subs = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (name, sub) in subs.iter() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| sub(event)));
            if outcome.is_err() {
                warn!(subscriber = %name, action = event.action(), "event subscriber panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, ScopeRef};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn created_event() -> MemoryEvent {
        MemoryEvent::EntryCreated {
            kind: EntryKind::Knowledge,
            id: "e1".into(),
            scope: ScopeRef::global(),
        }
    }

    #[test]
    fn test_emit_bumps_epoch_and_delivers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.subscribe("counter", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        let before = bus.epoch();
        bus.emit(&created_event());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(bus.epoch() > before);
    }

    #[test]
    fn test_lock_events_leave_epoch_alone() {
        let bus = EventBus::new();
        let before = bus.epoch();
        bus.emit(&MemoryEvent::LockChanged {
            file_path: "/abs/x".into(),
        });
        assert_eq!(bus.epoch(), before);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.subscribe("bad", |_| panic!("subscriber bug"));
        bus.subscribe("good", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&created_event());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
