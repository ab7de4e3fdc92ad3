//! The indexed collection of queries, with prefix matching and a
//! synchronous event bus.
//!
//! Grounded on the teacher's `client::QueryClient` (the `HashMap<QueryKey,
//! CacheEntry>` plus `invalidate_queries`/`cleanup_stale_entries`/
//! `cache_stats`), split out of the client facade so the client
//! (`src/client.rs`) only orchestrates, per §4.5's "indexed collection of
//! `Query` instances" boundary.

use crate::key::{QueryHash, QueryKey, QueryKeyPattern};
use crate::query::{CacheHandle, Query};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

/// Events fanned out synchronously to anyone holding a `CacheEvent`
/// receiver (devtools-style consumers, or an observer's own bookkeeping).
#[derive(Clone, Debug)]
pub enum CacheEvent {
    Added(QueryHash),
    Updated(QueryHash),
    Removed(QueryHash),
    ObserverAdded(QueryHash),
    ObserverRemoved(QueryHash),
}

struct Shared {
    queries: RwLock<HashMap<QueryHash, Arc<Query>>>,
    events: broadcast::Sender<CacheEvent>,
    default_gc_time: Duration,
}

impl CacheHandle for Shared {
    /// Schedules GC for `hash` after `gc_time`. Takes `self: Arc<Self>` (the
    /// same arbitrary-self-type pattern as `std::task::Wake`) so the
    /// spawned task can hold its own strong reference to the cache without
    /// `Query` needing to know `QueryCache`'s concrete type.
    fn on_query_idle(self: Arc<Self>, hash: QueryHash, gc_time: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(gc_time).await;
            let removed = {
                let mut queries = self.queries.write();
                match queries.get(&hash) {
                    Some(q) if q.observer_count() == 0 => queries.remove(&hash).is_some(),
                    _ => false,
                }
            };
            if removed {
                tracing::debug!(%hash, "garbage collected idle query");
                let _ = self.events.send(CacheEvent::Removed(hash));
            }
        });
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }
}

/// The cache's collection of queries. Cheap to clone: it's a thin handle
/// around an `Arc<Shared>`.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<Shared>,
}

impl QueryCache {
    pub fn new(default_gc_time: Duration) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                queries: RwLock::new(HashMap::new()),
                events,
                default_gc_time,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    /// Fetch the `Query` for `key`, creating it if absent.
    pub fn get_or_create(&self, key: QueryKey) -> Result<Arc<Query>, crate::key::EncodingError> {
        self.get_or_create_tracked(key).map(|(query, _created)| query)
    }

    /// Same as [`Self::get_or_create`], but also reports whether this call
    /// is the one that created the `Query` — used by `initialData` seeding
    /// (§4.7), which only applies "on first creation".
    pub fn get_or_create_tracked(
        &self,
        key: QueryKey,
    ) -> Result<(Arc<Query>, bool), crate::key::EncodingError> {
        let hash = key.hash()?;
        {
            let existing = self.shared.queries.read();
            if let Some(q) = existing.get(&hash) {
                return Ok((q.clone(), false));
            }
        }
        let mut queries = self.shared.queries.write();
        if let Some(q) = queries.get(&hash) {
            return Ok((q.clone(), false));
        }
        let handle: Weak<dyn CacheHandle> = Arc::downgrade(&self.shared);
        let query = Query::new(key, hash.clone(), handle, self.shared.default_gc_time);
        queries.insert(hash.clone(), query.clone());
        drop(queries);
        self.shared.emit(CacheEvent::Added(hash));
        Ok((query, true))
    }

    pub fn get(&self, hash: &QueryHash) -> Option<Arc<Query>> {
        self.shared.queries.read().get(hash).cloned()
    }

    pub fn remove(&self, hash: &QueryHash) -> Option<Arc<Query>> {
        let removed = self.shared.queries.write().remove(hash);
        if removed.is_some() {
            self.shared.emit(CacheEvent::Removed(hash.clone()));
        }
        removed
    }

    pub fn clear(&self) {
        let hashes: Vec<QueryHash> = {
            let mut queries = self.shared.queries.write();
            let hashes = queries.keys().cloned().collect();
            queries.clear();
            hashes
        };
        for hash in hashes {
            self.shared.emit(CacheEvent::Removed(hash));
        }
    }

    pub fn find_all(&self, pattern: &QueryKeyPattern) -> Vec<Arc<Query>> {
        self.shared
            .queries
            .read()
            .values()
            .filter(|q| pattern.matches(&q.key))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Query>> {
        self.shared.queries.read().values().cloned().collect()
    }

    pub fn notify_observer_added(&self, hash: &QueryHash) {
        self.shared.emit(CacheEvent::ObserverAdded(hash.clone()));
    }

    pub fn notify_observer_removed(&self, hash: &QueryHash) {
        self.shared.emit(CacheEvent::ObserverRemoved(hash.clone()));
    }

    pub fn cache_stats(&self) -> CacheStats {
        let queries = self.shared.queries.read();
        let total = queries.len();
        let stale = queries
            .values()
            .filter(|q| q.is_stale(Duration::ZERO))
            .count();
        CacheStats {
            total_entries: total,
            stale_entries: stale,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub stale_entries: usize,
}
