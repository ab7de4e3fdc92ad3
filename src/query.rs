//! A single cached query: its state machine, observer bookkeeping, and the
//! single-flight fetch lease that backs [`crate::fetch`].
//!
//! Grounded on the teacher's `client::CacheEntry` (state/staleness) and
//! `dedup::RequestDeduplicator` (single-flight via subscriber fan-out),
//! merged into one owner per cache entry instead of two separate maps, since
//! both always need to be locked together in practice.

use crate::cache::CacheEvent;
use crate::cancellation::{CancellationSignal, FetchContext};
use crate::key::{QueryHash, QueryKey};
use crate::retry::{execute_with_retry, QueryError, RetryConfig};
use crate::state::{DataSlot, FetchStatus, QueryMeta, QueryStatus, RawQueryState};
use parking_lot::RwLock;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type ErasedData = Arc<dyn Any + Send + Sync>;
pub type ErasedFetcher =
    Arc<dyn Fn(FetchContext) -> BoxFuture<Result<ErasedData, QueryError>> + Send + Sync>;

/// Identifies one observer attached to a query, independent of its type `T`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything a `Query` needs back from its owning cache: GC callback and the
/// synchronous event bus. Implemented by `QueryCache`'s shared inner state;
/// kept as a trait so `query.rs` and `cache.rs` don't need to know each
/// other's concrete layout beyond this seam.
pub trait CacheHandle: Send + Sync {
    fn on_query_idle(self: Arc<Self>, hash: QueryHash, gc_time: Duration);
    fn emit(&self, event: CacheEvent);
}

struct CurrentFetch {
    signal: CancellationSignal,
    generation: u64,
    rx: watch::Receiver<Option<Result<ErasedData, QueryError>>>,
}

struct Inner {
    raw: RawQueryState,
    observers: std::collections::HashSet<ObserverId>,
    fetcher: Option<ErasedFetcher>,
    retry: Option<RetryConfig>,
    current_fetch: Option<CurrentFetch>,
    meta: QueryMeta,
    gc_time: Duration,
    to_json: Option<Arc<dyn Fn(&ErasedData) -> Option<serde_json::Value> + Send + Sync>>,
}

pub struct Query {
    pub key: QueryKey,
    pub hash: QueryHash,
    cache: Weak<dyn CacheHandle>,
    inner: RwLock<Inner>,
    state_tx: watch::Sender<RawQueryState>,
    generation: AtomicU64,
}

impl Query {
    pub fn new(
        key: QueryKey,
        hash: QueryHash,
        cache: Weak<dyn CacheHandle>,
        gc_time: Duration,
    ) -> Arc<Self> {
        let raw = RawQueryState::new();
        let (state_tx, _rx) = watch::channel(raw.clone());
        Arc::new(Self {
            key,
            hash,
            cache,
            inner: RwLock::new(Inner {
                raw,
                observers: Default::default(),
                fetcher: None,
                retry: None,
                current_fetch: None,
                meta: QueryMeta::default(),
                gc_time,
                to_json: None,
            }),
            state_tx,
            generation: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> RawQueryState {
        self.inner.read().raw.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RawQueryState> {
        self.state_tx.subscribe()
    }

    pub fn meta(&self) -> QueryMeta {
        self.inner.read().meta.clone()
    }

    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.inner.read().raw.is_stale(stale_time)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.read().observers.len()
    }

    /// Register the fetcher the first attached observer provides. Later
    /// observers update it too (the most recently (re)rendered observer's
    /// query function is what background refetches use), but the retry
    /// policy stays first-observer-wins per the resolved open question.
    pub fn add_observer(&self, id: ObserverId, fetcher: ErasedFetcher, retry: RetryConfig) {
        let mut inner = self.inner.write();
        inner.fetcher = Some(fetcher);
        if inner.observers.is_empty() {
            inner.retry = Some(retry);
        }
        inner.observers.insert(id);
    }

    /// Remove an observer, scheduling GC if this was the last one.
    pub fn remove_observer(&self, id: ObserverId) {
        let (now_empty, gc_time) = {
            let mut inner = self.inner.write();
            inner.observers.remove(&id);
            (inner.observers.is_empty(), inner.gc_time)
        };
        if now_empty {
            if let Some(cache) = self.cache.upgrade() {
                cache.on_query_idle(self.hash.clone(), gc_time);
            }
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.inner.read().retry.clone().unwrap_or_default()
    }

    fn publish(&self, inner: &Inner) {
        let _ = self.state_tx.send(inner.raw.clone());
        if let Some(cache) = self.cache.upgrade() {
            cache.emit(CacheEvent::Updated(self.hash.clone()));
        }
    }

    /// Direct cache write (`setQueryData`). Does not touch an in-flight
    /// fetch; per the resolved open question, a running fetch races with
    /// this write and whichever completes last wins.
    pub fn set_data(&self, data: ErasedData) {
        self.seed_data(data, None);
    }

    /// Like `set_data`, but lets the caller backdate `data_updated_at` — used
    /// by `Observer`'s `initialData`/`initialDataUpdatedAt` seeding, where
    /// the caller may know the data is already some age old.
    pub fn seed_data(&self, data: ErasedData, updated_at: Option<Instant>) {
        let mut inner = self.inner.write();
        inner.raw.status = QueryStatus::Success;
        inner.raw.data = Some(DataSlot::Typed(data));
        inner.raw.data_updated_at = Some(updated_at.unwrap_or_else(Instant::now));
        inner.raw.error = None;
        inner.raw.is_invalidated = false;
        self.publish(&inner);
    }

    /// Seeds this query from a persisted record, at most once (`hydrate`
    /// restores all registered queries each run but must be idempotent per
    /// key). Stores the data as an opaque `Raw` blob; a typed observer (or
    /// `QueryClient::get_query_data`) materializes it into `Typed` lazily.
    /// Does nothing, and returns `false`, if this query already has data.
    pub fn hydrate_raw(
        &self,
        value: serde_json::Value,
        status: QueryStatus,
        data_updated_at: Instant,
    ) -> bool {
        let mut inner = self.inner.write();
        if inner.raw.data.is_some() {
            return false;
        }
        inner.raw.status = status;
        inner.raw.data = Some(DataSlot::Raw(value));
        inner.raw.data_updated_at = Some(data_updated_at);
        self.publish(&inner);
        true
    }

    /// Registers the erased-to-JSON conversion for this query's `T`, so
    /// `raw_data` can snapshot a `Typed` slot without knowing `T` itself.
    /// Called once by `QueryClient::build_query`, which does know `T`.
    pub fn set_serializer(
        &self,
        to_json: Arc<dyn Fn(&ErasedData) -> Option<serde_json::Value> + Send + Sync>,
    ) {
        self.inner.write().to_json = Some(to_json);
    }

    /// If this query's data is currently an undeserialized `Raw` blob
    /// (restored by `hydrate`), deserialize it into `T` via `f` and replace
    /// it with a `Typed` slot, preserving `status`/`data_updated_at`. No-op
    /// (returns `Ok(false)`) if the slot is already `Typed` or absent.
    pub fn materialize_raw<T: Send + Sync + 'static, E>(
        &self,
        f: impl FnOnce(serde_json::Value) -> Result<T, E>,
    ) -> Result<bool, E> {
        let value = {
            let inner = self.inner.read();
            match &inner.raw.data {
                Some(DataSlot::Raw(v)) => v.clone(),
                _ => return Ok(false),
            }
        };
        let typed = f(value)?;
        let mut inner = self.inner.write();
        if matches!(inner.raw.data, Some(DataSlot::Raw(_))) {
            inner.raw.data = Some(DataSlot::Typed(Arc::new(typed) as ErasedData));
        }
        self.publish(&inner);
        Ok(true)
    }

    /// The current data slot as raw JSON, if present and representable —
    /// used by `dehydrate` to snapshot whatever a query currently holds,
    /// whether it arrived by fetch, `setQueryData`, or an earlier hydrate.
    pub fn raw_data(&self) -> Option<serde_json::Value> {
        let inner = self.inner.read();
        match &inner.raw.data {
            None => None,
            Some(DataSlot::Raw(v)) => Some(v.clone()),
            Some(DataSlot::Typed(d)) => inner.to_json.as_ref().and_then(|f| f(d)),
        }
    }

    pub fn invalidate(&self) {
        let mut inner = self.inner.write();
        inner.raw.is_invalidated = true;
        self.publish(&inner);
    }

    /// Cancel any in-flight fetch without starting a new one.
    pub fn cancel(&self) {
        let inner = self.inner.read();
        if let Some(cur) = &inner.current_fetch {
            cur.signal.cancel();
        }
    }

    /// Mark this query paused (offline, `networkMode: online`) without
    /// surfacing it as an error status — `fetch_status` alone reflects it.
    pub fn set_paused(&self) {
        let mut inner = self.inner.write();
        inner.raw.fetch_status = FetchStatus::Paused;
        self.publish(&inner);
    }

    /// Ensure a fetch is running, joining an in-flight one unless `force`
    /// requests a fresh attempt (cancelling the old one).
    ///
    /// This is the single-flight guarantee: concurrent callers for the same
    /// query observe exactly one query-function invocation per generation.
    pub async fn ensure_fetch(
        self: &Arc<Self>,
        query_fn_override: Option<ErasedFetcher>,
        retry_override: Option<RetryConfig>,
        force: bool,
    ) -> Result<ErasedData, QueryError> {
        enum Lease {
            Join(watch::Receiver<Option<Result<ErasedData, QueryError>>>),
            Start {
                signal: CancellationSignal,
                generation: u64,
                fetcher: ErasedFetcher,
                retry: RetryConfig,
                tx: watch::Sender<Option<Result<ErasedData, QueryError>>>,
            },
        }

        let lease = {
            let mut inner = self.inner.write();
            if let Some(cur) = &inner.current_fetch {
                if !force {
                    Lease::Join(cur.rx.clone())
                } else {
                    cur.signal.cancel();
                    let start = self.start_lease(&mut inner, query_fn_override, retry_override)?;
                    Lease::Start {
                        signal: start.signal,
                        generation: start.generation,
                        fetcher: start.fetcher,
                        retry: start.retry,
                        tx: start.tx,
                    }
                }
            } else {
                let start = self.start_lease(&mut inner, query_fn_override, retry_override)?;
                Lease::Start {
                    signal: start.signal,
                    generation: start.generation,
                    fetcher: start.fetcher,
                    retry: start.retry,
                    tx: start.tx,
                }
            }
        };

        match lease {
            Lease::Join(mut rx) => loop {
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(QueryError::Cancelled);
                }
            },
            Lease::Start {
                signal,
                generation,
                fetcher,
                retry,
                tx,
            } => {
                let started_at = Instant::now();
                let result = execute_with_retry(&retry, &signal, |ctx| fetcher(ctx)).await;
                let duration = started_at.elapsed();
                self.complete_fetch(generation, result.clone(), duration);
                let _ = tx.send(Some(result.clone()));
                result
            }
        }
    }

    fn start_lease(
        self: &Arc<Self>,
        inner: &mut Inner,
        query_fn_override: Option<ErasedFetcher>,
        retry_override: Option<RetryConfig>,
    ) -> Result<
        LeaseStart,
        QueryError,
    > {
        let fetcher = query_fn_override
            .or_else(|| inner.fetcher.clone())
            .ok_or_else(|| QueryError::custom("no query function registered for this key"))?;
        let retry = retry_override.unwrap_or_else(|| inner.retry.clone().unwrap_or_default());
        let signal = CancellationSignal::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = watch::channel(None);
        inner.current_fetch = Some(CurrentFetch {
            signal: signal.clone(),
            generation,
            rx,
        });
        inner.raw.fetch_status = FetchStatus::Fetching;
        self.publish(inner);
        Ok(LeaseStart {
            signal,
            generation,
            fetcher,
            retry,
            tx,
        })
    }

    fn complete_fetch(
        &self,
        generation: u64,
        result: Result<ErasedData, QueryError>,
        duration: Duration,
    ) {
        let mut inner = self.inner.write();
        let still_current = matches!(&inner.current_fetch, Some(c) if c.generation == generation);
        if still_current {
            inner.current_fetch = None;
        }
        inner.raw.fetch_status = FetchStatus::Idle;
        inner.meta.record_fetch(duration);
        match result {
            Ok(data) => {
                inner.raw.status = QueryStatus::Success;
                inner.raw.data = Some(DataSlot::Typed(data));
                inner.raw.data_updated_at = Some(Instant::now());
                inner.raw.error = None;
                inner.raw.fetch_failure_count = 0;
                inner.raw.is_invalidated = false;
            }
            Err(QueryError::Cancelled) => {
                // A cancelled attempt never touches status/data/error.
            }
            Err(err) => {
                inner.meta.record_error();
                inner.raw.status = QueryStatus::Error;
                inner.raw.error = Some(err);
                inner.raw.error_updated_at = Some(Instant::now());
                inner.raw.fetch_failure_count += 1;
            }
        }
        self.publish(&inner);
    }
}

// Helper struct to appease the borrow checker across the match in
// `ensure_fetch` (named fields can't be returned from a block expression
// that also holds `inner`'s write guard past its scope).
struct LeaseStart {
    signal: CancellationSignal,
    generation: u64,
    fetcher: ErasedFetcher,
    retry: RetryConfig,
    tx: watch::Sender<Option<Result<ErasedData, QueryError>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct NoopCache;
    impl CacheHandle for NoopCache {
        fn on_query_idle(self: Arc<Self>, _hash: QueryHash, _gc_time: Duration) {}
        fn emit(&self, _event: CacheEvent) {}
    }

    fn test_query() -> Arc<Query> {
        let key = QueryKey::from(["todos"]);
        let hash = key.hash().unwrap();
        let cache: Arc<dyn CacheHandle> = Arc::new(NoopCache);
        Query::new(key, hash, Arc::downgrade(&cache), Duration::from_secs(5))
    }

    fn fetcher(calls: Arc<AtomicU32>) -> ErasedFetcher {
        Arc::new(move |_ctx: FetchContext| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(7i32) as ErasedData)
            })
        })
    }

    #[tokio::test]
    async fn concurrent_fetches_single_flight() {
        let query = test_query();
        let calls = Arc::new(AtomicU32::new(0));
        query.add_observer(ObserverId::new(), fetcher(calls.clone()), RetryConfig::default());

        let q1 = query.clone();
        let q2 = query.clone();
        let (r1, r2) = tokio::join!(
            q1.ensure_fetch(None, None, false),
            q2.ensure_fetch(None, None, false)
        );
        assert_eq!(*r1.unwrap().downcast::<i32>().unwrap(), 7);
        assert_eq!(*r2.unwrap().downcast::<i32>().unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refetch_starts_new_generation() {
        let query = test_query();
        let calls = Arc::new(AtomicU32::new(0));
        query.add_observer(ObserverId::new(), fetcher(calls.clone()), RetryConfig::default());
        query.ensure_fetch(None, None, false).await.unwrap();
        query.ensure_fetch(None, None, true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn set_data_updates_state_without_fetch() {
        let query = test_query();
        query.set_data(Arc::new(99i32));
        let state = query.state();
        assert_eq!(state.status, QueryStatus::Success);
        match state.data.unwrap() {
            DataSlot::Typed(d) => assert_eq!(*d.downcast::<i32>().unwrap(), 99),
            DataSlot::Raw(_) => panic!("expected a typed slot"),
        }
    }

    #[tokio::test]
    async fn set_paused_marks_fetch_status_without_touching_data() {
        let query = test_query();
        query.set_paused();
        let state = query.state();
        assert_eq!(state.fetch_status, FetchStatus::Paused);
        assert_eq!(state.status, QueryStatus::Pending);
    }

    #[tokio::test]
    async fn materialize_raw_deserializes_then_is_idempotent() {
        let query = test_query();
        query.hydrate_raw(serde_json::json!(21), QueryStatus::Success, Instant::now());
        let materialized: Result<bool, serde_json::Error> =
            query.materialize_raw(|v| serde_json::from_value::<i32>(v));
        assert!(materialized.unwrap());
        match query.state().data.unwrap() {
            DataSlot::Typed(d) => assert_eq!(*d.downcast::<i32>().unwrap(), 21),
            DataSlot::Raw(_) => panic!("expected a typed slot after materializing"),
        }
        let materialized_again: Result<bool, serde_json::Error> =
            query.materialize_raw(|v| serde_json::from_value::<i32>(v));
        assert!(!materialized_again.unwrap());
    }

    #[tokio::test]
    async fn hydrate_raw_seeds_once() {
        let query = test_query();
        let seeded = query.hydrate_raw(serde_json::json!(7), QueryStatus::Success, Instant::now());
        assert!(seeded);
        assert_eq!(query.raw_data(), Some(serde_json::json!(7)));
        let seeded_again =
            query.hydrate_raw(serde_json::json!(9), QueryStatus::Success, Instant::now());
        assert!(!seeded_again);
        assert_eq!(query.raw_data(), Some(serde_json::json!(7)));
    }

    #[tokio::test]
    async fn failing_fetch_marks_error_and_increments_failure_count() {
        let query = test_query();
        let fetcher: ErasedFetcher = Arc::new(|_ctx: FetchContext| {
            Box::pin(async { Err(QueryError::network("boom")) })
        });
        query.add_observer(ObserverId::new(), fetcher, RetryConfig::none());
        let result = query.ensure_fetch(None, None, false).await;
        assert!(result.is_err());
        let state = query.state();
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.fetch_failure_count, 1);
    }
}
