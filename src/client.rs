//! The facade that ties cache, fetch coordination, observers, mutations and
//! persistence together — `QueryClient`, grounded on the teacher's
//! `client::QueryClient` (same role: the one type applications hold), with
//! its HashMap-of-entries body split out into [`crate::cache::QueryCache`]
//! and its fetch/retry logic split into [`crate::fetch`]/[`crate::query`].

use crate::cache::QueryCache;
use crate::cancellation::FetchContext;
use crate::fetch::{
    ConnectivityMonitor, ExternalEvents, FetchCoordinator, NetworkMode, NoExternalEvents,
};
use crate::infinite::{InfiniteObserver, InfiniteQueryOptions};
use crate::key::{QueryKey, QueryKeyPattern};
use crate::mutation::{Mutation, MutationCache, MutationOptions};
use crate::observer::{Observer, ObserverOptions};
use crate::persistence::{PersistError, PersistOptions, PersistedQuery, PersistenceManager, Persister};
use crate::query::ErasedData;
use crate::retry::{QueryError, RetryConfig};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Defaults applied to every query/observer built through this client,
/// unless overridden per-call. Mirrors the teacher's
/// `QueryClient::with_settings` constructor plus `PersistenceConfig`'s
/// builder defaults.
#[derive(Clone)]
pub struct QueryClientConfig {
    pub default_stale_time: Duration,
    pub default_gc_time: Duration,
    pub default_retry: RetryConfig,
    pub default_network_mode: NetworkMode,
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            default_stale_time: Duration::ZERO,
            default_gc_time: Duration::from_secs(5 * 60),
            default_retry: RetryConfig::default(),
            default_network_mode: NetworkMode::default(),
        }
    }
}

/// The application-facing entry point: owns the cache, fetch coordinator,
/// mutation bookkeeping, and optional persistence.
pub struct QueryClient {
    cache: QueryCache,
    coordinator: Arc<FetchCoordinator>,
    events: Arc<dyn ExternalEvents>,
    mutations: Arc<MutationCache>,
    persistence: Option<Arc<PersistenceManager>>,
    hydrated: AtomicBool,
    config: QueryClientConfig,
}

impl QueryClient {
    pub fn new(config: QueryClientConfig) -> Self {
        Self {
            cache: QueryCache::new(config.default_gc_time),
            coordinator: Arc::new(FetchCoordinator::online()),
            events: Arc::new(NoExternalEvents::default()),
            mutations: Arc::new(MutationCache::new()),
            persistence: None,
            hydrated: AtomicBool::new(false),
            config,
        }
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn ConnectivityMonitor>) -> Self {
        self.coordinator = Arc::new(FetchCoordinator::new(connectivity));
        self
    }

    /// Wire in a focus/reconnect event source so observers built with
    /// `refetch_on_window_focus`/`refetch_on_reconnect` actually fire. The
    /// default never fires.
    pub fn with_external_events(mut self, events: Arc<dyn ExternalEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_persister(mut self, persister: Box<dyn Persister>) -> Self {
        self.persistence = Some(Arc::new(PersistenceManager::new(persister)));
        self
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn mutation_stats(&self) -> crate::mutation::MutationCacheStats {
        self.mutations.stats()
    }

    /// Build a live observer for `key`, running the initial fetch per its
    /// options. This is the primary entry point applications use (the
    /// `useQuery`-equivalent), returning a handle the caller keeps alive
    /// for as long as they're interested in the query.
    pub fn build_query<T, F, Fut>(
        &self,
        key: QueryKey,
        query_fn: F,
        mut options: ObserverOptions<T>,
    ) -> Arc<Observer<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        if options.stale_time == Duration::ZERO {
            options.stale_time = self.config.default_stale_time;
        }
        let hash = key.hash().ok();

        // If an earlier `hydrate()` restored this key as an opaque `Raw`
        // blob, this is the first call with a concrete `T` in scope to
        // deserialize it.
        if let (Some(hash), Some(persistence)) = (&hash, &self.persistence) {
            if let Some(existing) = self.cache.get(hash) {
                let persistence = persistence.clone();
                let hash_for_closure = hash.clone();
                let materialized = existing
                    .materialize_raw::<T, PersistError>(|v| persistence.deserialize::<T>(&hash_for_closure, v));
                if let Err(_err) = materialized {
                    if persistence.removes_on_deserialization_error(hash) {
                        let persistence = persistence.clone();
                        let hash = hash.clone();
                        tokio::spawn(async move {
                            let _ = persistence.remove(&hash).await;
                        });
                    }
                }
            }
        }

        let persistence = self.persistence.clone();
        let hash_for_persist = hash.clone();
        let key_for_persist = key.clone();
        let wrapped = move |ctx: FetchContext| {
            let query_fn_result = query_fn(ctx);
            let persistence = persistence.clone();
            let hash = hash_for_persist.clone();
            let key = key_for_persist.clone();
            async move {
                let result = query_fn_result.await;
                if let (Ok(data), Some(persistence), Some(hash)) =
                    (&result, persistence.as_ref(), hash.as_ref())
                {
                    let _ = persistence
                        .persist(hash, &key, crate::state::QueryStatus::Success, data)
                        .await;
                }
                result
            }
        };
        let observer = Observer::new_with_events(
            self.cache.clone(),
            self.coordinator.clone(),
            self.events.clone(),
            key,
            wrapped,
            options,
        );
        observer.query().set_serializer(Arc::new(|data: &ErasedData| {
            data.clone()
                .downcast::<T>()
                .ok()
                .and_then(|v| serde_json::to_value(&*v).ok())
        }));
        observer
    }

    pub fn build_infinite_query<TData, TPageParam, F, Fut>(
        &self,
        key: QueryKey,
        fetch_page: F,
        options: InfiniteQueryOptions<TData, TPageParam>,
    ) -> Arc<InfiniteObserver<TData, TPageParam>>
    where
        TData: Send + Sync + 'static,
        TPageParam: Clone + Send + Sync + 'static,
        F: Fn(TPageParam, FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TData, QueryError>> + Send + 'static,
    {
        InfiniteObserver::new(self.cache.clone(), self.coordinator.clone(), key, fetch_page, options)
    }

    pub fn build_mutation<TData, TVariables, TContext, F, Fut>(
        &self,
        mutation_fn: F,
        options: MutationOptions<TData, TVariables, TContext>,
    ) -> Arc<Mutation<TData, TVariables, TContext>>
    where
        TData: Send + Sync + 'static,
        TVariables: Clone + Send + Sync + 'static,
        TContext: Send + Sync + 'static,
        F: Fn(TVariables, crate::cancellation::CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TData, QueryError>> + Send + 'static,
    {
        let cache = self.cache.clone();
        let invalidate: Arc<dyn Fn(&[QueryKeyPattern]) + Send + Sync> =
            Arc::new(move |patterns: &[QueryKeyPattern]| {
                for pattern in patterns {
                    for query in cache.find_all(pattern) {
                        query.invalidate();
                    }
                }
            });
        let mutations = self.mutations.clone();
        let record: Arc<dyn Fn(bool) + Send + Sync> =
            Arc::new(move |ok: bool| mutations.record(ok));
        Mutation::with_recorder(mutation_fn, options, Some(invalidate), Some(record))
    }

    /// Run `query_fn` once and cache the result without attaching a
    /// long-lived observer (`prefetchQuery`). The entry becomes eligible
    /// for GC immediately afterward if nothing else observes it.
    pub async fn prefetch_query<T, F, Fut>(&self, key: QueryKey, query_fn: F) -> Result<(), QueryError>
    where
        T: Serialize + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let query = self
            .cache
            .get_or_create(key)
            .map_err(|e| QueryError::custom(format!("invalid query key: {e}")))?;
        query.set_serializer(Arc::new(|data: &ErasedData| {
            data.clone()
                .downcast::<T>()
                .ok()
                .and_then(|v| serde_json::to_value(&*v).ok())
        }));
        let erased: crate::query::ErasedFetcher = Arc::new(move |ctx| {
            let fut = query_fn(ctx);
            Box::pin(async move { fut.await.map(|v| Arc::new(v) as ErasedData) })
        });
        let result = query
            .ensure_fetch(Some(erased), Some(self.config.default_retry.clone()), false)
            .await;
        result.map(|_| ())
    }

    pub fn set_query_data<T: Serialize + Send + Sync + 'static>(&self, key: QueryKey, data: T) {
        if let Ok(query) = self.cache.get_or_create(key) {
            query.set_serializer(Arc::new(|data: &ErasedData| {
                data.clone()
                    .downcast::<T>()
                    .ok()
                    .and_then(|v| serde_json::to_value(&*v).ok())
            }));
            query.set_data(Arc::new(data));
        }
    }

    pub fn get_query_data<T: DeserializeOwned + Send + Sync + 'static>(
        &self,
        key: &QueryKey,
    ) -> Option<Arc<T>> {
        let hash = key.hash().ok()?;
        let query = self.cache.get(&hash)?;
        query.state().typed_data::<T>()
    }

    /// Mark matching queries invalidated and, for any with active
    /// observers, kick off a background refetch.
    pub fn invalidate_queries(&self, pattern: &QueryKeyPattern) {
        for query in self.cache.find_all(pattern) {
            query.invalidate();
            if query.observer_count() > 0 {
                let query = query.clone();
                tokio::spawn(async move {
                    let _ = query.ensure_fetch(None, None, false).await;
                });
            }
        }
    }

    pub fn cancel_queries(&self, pattern: &QueryKeyPattern) {
        for query in self.cache.find_all(pattern) {
            query.cancel();
        }
    }

    pub async fn refetch_queries(&self, pattern: &QueryKeyPattern) {
        let queries = self.cache.find_all(pattern);
        let futures = queries
            .into_iter()
            .filter(|q| q.observer_count() > 0)
            .map(|q| async move { q.ensure_fetch(None, None, true).await });
        futures::future::join_all(futures).await;
    }

    pub fn remove_queries(&self, pattern: &QueryKeyPattern) {
        let hashes: Vec<_> = self
            .cache
            .find_all(pattern)
            .into_iter()
            .map(|q| q.hash.clone())
            .collect();
        for hash in hashes {
            self.cache.remove(&hash);
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.cache_stats()
    }

    /// Opt `key` into write-through persistence. Registration is
    /// first-observer-wins, same as `Observer` retry precedence.
    pub fn enable_persistence(&self, key: &QueryKey, options: PersistOptions) {
        if let (Some(persistence), Ok(hash)) = (&self.persistence, key.hash()) {
            persistence.register(hash, options);
        }
    }

    /// Restore every persisted record into the cache as a typed observer
    /// attaches to claim it, seeding queries that don't exist yet. Runs at
    /// most once per client — later calls are no-ops, so application start-up
    /// code can call this unconditionally without double-seeding data a
    /// fetch has since overwritten.
    pub async fn hydrate(&self) -> Result<(), PersistError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        if self.hydrated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let records = persistence.restore_all().await?;
        for record in records {
            let Ok(hash) = record.query_key.hash() else {
                continue;
            };
            if !persistence.is_within_max_age(&hash, &record) {
                tracing::debug!(%hash, "skipping persisted record past max age during hydrate");
                continue;
            }
            let Ok(query) = self.cache.get_or_create(record.query_key.clone()) else {
                continue;
            };
            let age = std::time::Duration::from_secs(
                Utc::now()
                    .signed_duration_since(record.data_updated_at)
                    .num_seconds()
                    .max(0) as u64,
            );
            let approx_instant = std::time::Instant::now()
                .checked_sub(age)
                .unwrap_or_else(std::time::Instant::now);
            query.hydrate_raw(record.data, record.status.into(), approx_instant);
        }
        Ok(())
    }

    /// Snapshot every query that has registered persistence, whatever its
    /// data currently is (fetched, `setQueryData`-written, or hydrated) —
    /// not a passthrough of whatever the backend happens to already hold.
    pub async fn dehydrate(&self) -> Result<Vec<PersistedQuery>, PersistError> {
        let Some(persistence) = &self.persistence else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for query in self.cache.all() {
            if !persistence.is_registered(&query.hash) {
                continue;
            }
            let Some(data) = query.raw_data() else {
                continue;
            };
            let state = query.state();
            let elapsed = state.data_updated_at.map(|t| t.elapsed()).unwrap_or_default();
            let data_updated_at =
                Utc::now() - chrono::Duration::from_std(elapsed).unwrap_or_default();
            let record = PersistedQuery {
                hash: query.hash.as_str().to_string(),
                query_key: query.key.clone(),
                data,
                data_updated_at,
                persisted_at: Utc::now(),
                status: state.status.into(),
            };
            persistence.persist_record(record.clone()).await?;
            out.push(record);
        }
        Ok(out)
    }
}
