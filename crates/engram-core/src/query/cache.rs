//! Bounded TTL+LRU cache for query results.
//!
//! Keys are canonical serialized params; every entry also records the bus
//! epoch at insert time. A write bumps the epoch, so stale entries
//! self-invalidate on the next lookup without any locking.

use super::QueryResults;
use crate::events::EventBus;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheSlot {
    value: QueryResults,
    epoch: u64,
    inserted_at: Instant,
    last_used: Instant,
}

/// Cache statistics for health reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct QueryCache {
    slots: DashMap<String, CacheSlot>,
    bus: Arc<EventBus>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new(bus: Arc<EventBus>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            slots: DashMap::new(),
            bus,
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<QueryResults> {
        let epoch = self.bus.epoch();
        let mut stale = false;
        let value = match self.slots.get_mut(key) {
            Some(mut slot) => {
                if slot.epoch != epoch || slot.inserted_at.elapsed() > self.ttl {
                    stale = true;
                    None
                } else {
                    slot.last_used = Instant::now();
                    Some(slot.value.clone())
                }
            }
            None => None,
        };
        if stale {
            self.slots.remove(key);
        }
        match &value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    pub fn put(&self, key: String, value: QueryResults) {
        if self.slots.len() >= self.max_entries {
            self.evict_one();
        }
        let now = Instant::now();
        self.slots.insert(
            key,
            CacheSlot {
                value,
                epoch: self.bus.epoch(),
                inserted_at: now,
                last_used: now,
            },
        );
    }

    /// Evict a stale slot when one exists, the least-recently-used otherwise.
    fn evict_one(&self) {
        let epoch = self.bus.epoch();
        let mut stale: Option<String> = None;
        let mut lru: Option<(String, Instant)> = None;
        for slot in self.slots.iter() {
            if slot.epoch != epoch || slot.inserted_at.elapsed() > self.ttl {
                stale = Some(slot.key().clone());
                break;
            }
            match &lru {
                Some((_, used)) if slot.last_used >= *used => {}
                _ => lru = Some((slot.key().clone(), slot.last_used)),
            }
        }
        if let Some(key) = stale.or_else(|| lru.map(|(k, _)| k)) {
            self.slots.remove(&key);
        }
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.slots.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, MemoryEvent, ScopeRef};
    use crate::query::{QueryMeta, QueryResults};

    fn results(n: usize) -> QueryResults {
        QueryResults {
            items: Vec::new(),
            meta: QueryMeta {
                total_count: n,
                returned_count: 0,
                truncated: false,
                has_more: false,
                degraded: Vec::new(),
                cache_hit: false,
            },
        }
    }

    fn write_event() -> MemoryEvent {
        MemoryEvent::EntryCreated {
            kind: EntryKind::Knowledge,
            id: "x".into(),
            scope: ScopeRef::global(),
        }
    }

    #[test]
    fn test_hit_then_invalidated_by_write() {
        let bus = Arc::new(EventBus::new());
        let cache = QueryCache::new(bus.clone(), Duration::from_secs(60), 16);
        cache.put("q1".into(), results(3));
        assert!(cache.get("q1").is_some());

        bus.emit(&write_event());
        assert!(cache.get("q1").is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let bus = Arc::new(EventBus::new());
        let cache = QueryCache::new(bus, Duration::from_millis(0), 16);
        cache.put("q1".into(), results(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("q1").is_none());
    }

    #[test]
    fn test_bounded_size() {
        let bus = Arc::new(EventBus::new());
        let cache = QueryCache::new(bus, Duration::from_secs(60), 2);
        cache.put("a".into(), results(1));
        cache.put("b".into(), results(2));
        cache.put("c".into(), results(3));
        assert!(cache.stats().entries <= 2);
    }

    #[test]
    fn test_stats_count_hits_and_misses() {
        let bus = Arc::new(EventBus::new());
        let cache = QueryCache::new(bus, Duration::from_secs(60), 4);
        cache.put("a".into(), results(1));
        cache.get("a");
        cache.get("nope");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
