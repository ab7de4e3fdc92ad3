//! Unit tests for cache operations and invalidation patterns.

#[path = "../utils/mod.rs"]
mod utils;

use async_query::{
    FetchContext, ObserverId, ObserverOptions, QueryCache, QueryClient, QueryClientConfig,
    QueryKey, QueryKeyPattern, RetryConfig,
};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn get_or_create_returns_the_same_query_for_the_same_key() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let a = cache.get_or_create(QueryKey::from(["users", "1"])).unwrap();
    let b = cache.get_or_create(QueryKey::from(["users", "1"])).unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));
}

#[test]
fn find_all_with_prefix_pattern_scopes_to_descendants() {
    let cache = QueryCache::new(Duration::from_secs(60));
    cache.get_or_create(QueryKey::from(["users", "1"])).unwrap();
    cache.get_or_create(QueryKey::from(["users", "2"])).unwrap();
    cache.get_or_create(QueryKey::from(["posts", "1"])).unwrap();

    let users = cache.find_all(&QueryKeyPattern::Prefix(QueryKey::from(["users"])));
    assert_eq!(users.len(), 2);
}

#[test]
fn clear_empties_the_cache() {
    let cache = QueryCache::new(Duration::from_secs(60));
    cache.get_or_create(QueryKey::from(["a"])).unwrap();
    cache.get_or_create(QueryKey::from(["b"])).unwrap();
    cache.clear();
    assert_eq!(cache.cache_stats().total_entries, 0);
}

#[tokio::test]
async fn idle_queries_are_garbage_collected_after_gc_time() {
    let cache = QueryCache::new(Duration::from_millis(20));
    let query = cache.get_or_create(QueryKey::from(["a"])).unwrap();
    let hash = query.hash.clone();

    let id = ObserverId::new();
    let fetcher: async_query::query::ErasedFetcher =
        Arc::new(|_ctx: FetchContext| Box::pin(async { Ok(Arc::new(1i32) as async_query::query::ErasedData) }));
    query.add_observer(id, fetcher, RetryConfig::none());
    query.remove_observer(id);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(cache.get(&hash).is_none());
}

#[tokio::test]
async fn remove_queries_drops_matching_entries() {
    let client = QueryClient::new(QueryClientConfig::default());
    client.build_query(
        QueryKey::from(["users", "1"]),
        |_ctx: FetchContext| async { Ok(1i32) },
        ObserverOptions::default(),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.remove_queries(&QueryKeyPattern::Prefix(QueryKey::from(["users"])));
    assert_eq!(client.cache_stats().total_entries, 0);
}
