//! Property-based tests for the invariants enumerated for key
//! canonicalization, cache prefix matching, single-flight dispatch,
//! cancellation safety, and first-observer-wins precedence.

use async_query::{
    CancellationSignal, KeyPart, ObserverId, QueryCache, QueryKey, QueryKeyPattern, RetryConfig,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn segments_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-zA-Z0-9_]{1,20}", 1..6)
}

fn key_from_segments(segments: &[String]) -> QueryKey {
    QueryKey::new(segments.iter().map(|s| KeyPart::from(s.as_str())))
}

proptest! {
    // Key canonicalization is deterministic: building the same segments
    // twice always produces the same hash (§8.4).
    #[test]
    fn equal_segments_hash_equal(segments in segments_strategy()) {
        let a = key_from_segments(&segments);
        let b = key_from_segments(&segments);
        prop_assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    // Differently-typed primitives never collide: appending a string
    // segment vs. an int segment with the same textual value must hash
    // differently (§8.4).
    #[test]
    fn int_and_string_segments_never_collide(n in 0i64..10_000) {
        let as_str = QueryKey::new([KeyPart::Str(n.to_string())]);
        let as_int = QueryKey::new([KeyPart::Int(n)]);
        prop_assert_ne!(as_str.hash().unwrap(), as_int.hash().unwrap());
    }

    // Exact pattern always matches the key it was built from.
    #[test]
    fn exact_pattern_always_matches_itself(segments in segments_strategy()) {
        let key = key_from_segments(&segments);
        let pattern = QueryKeyPattern::Exact(key.clone());
        prop_assert!(pattern.matches(&key));
    }

    // A prefix pattern matches any key extended with further segments, and
    // never matches a key that's strictly shorter than the prefix.
    #[test]
    fn prefix_pattern_matches_exactly_its_descendants(
        prefix_segments in prop::collection::vec("[a-zA-Z0-9_]{1,20}", 1..3),
        suffix_segments in prop::collection::vec("[a-zA-Z0-9_]{1,20}", 0..3),
    ) {
        let prefix = key_from_segments(&prefix_segments);
        let mut full_segments = prefix_segments.clone();
        full_segments.extend(suffix_segments);
        let full_key = key_from_segments(&full_segments);

        let pattern = QueryKeyPattern::Prefix(prefix);
        prop_assert!(pattern.matches(&full_key));
    }

    // `QueryCache::get_or_create` is idempotent for any key: repeated calls
    // return the identical `Arc<Query>`, never a duplicate entry.
    #[test]
    fn get_or_create_is_idempotent(segments in segments_strategy()) {
        let cache = QueryCache::new(Duration::from_secs(60));
        let key = key_from_segments(&segments);
        let a = cache.get_or_create(key.clone()).unwrap();
        let b = cache.get_or_create(key).unwrap();
        prop_assert!(Arc::ptr_eq(&a, &b));
    }

    // Single-flight (§8.1): for N concurrent `ensure_fetch` calls on one
    // Query, the fetcher body runs exactly once and every caller observes
    // the same resolved value.
    #[test]
    fn concurrent_ensure_fetch_calls_share_one_execution(concurrency in 2usize..12) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let cache = QueryCache::new(Duration::from_secs(60));
            let query = cache.get_or_create(QueryKey::from(["dedup"])).unwrap();
            let calls = Arc::new(AtomicU32::new(0));

            let mut handles = Vec::new();
            for _ in 0..concurrency {
                let query = query.clone();
                let calls = calls.clone();
                handles.push(tokio::spawn(async move {
                    let fetcher: async_query::query::ErasedFetcher = Arc::new(move |_ctx| {
                        let calls = calls.clone();
                        Box::pin(async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(Arc::new(7i32) as async_query::query::ErasedData)
                        })
                    });
                    query
                        .ensure_fetch(Some(fetcher), Some(RetryConfig::none()), false)
                        .await
                }));
            }
            for h in handles {
                let result: Arc<i32> =
                    Arc::downcast(h.await.unwrap().unwrap()).unwrap();
                assert_eq!(*result, 7);
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    // Cancellation safety (§8.3): cancelling a `CancellationSignal` while a
    // cooperative fetch is sleeping on it always short-circuits that sleep,
    // regardless of how long the configured sleep is.
    #[test]
    fn cancelling_a_signal_always_wakes_a_cooperative_waiter(sleep_ms in 50u64..500) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let signal = CancellationSignal::new();
            let waiter_signal = signal.clone();
            let waiter = tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => false,
                    _ = waiter_signal.cancelled() => true,
                }
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
            signal.cancel();
            let was_cancelled = waiter.await.unwrap();
            assert!(was_cancelled);
        });
    }

    // First-observer-wins (§4.7, §E.3): of N observers racing to attach to
    // the same brand-new Query, only the first one's retry config takes
    // effect no matter how many attach afterward.
    #[test]
    fn first_observer_to_attach_sets_the_retry_config(extra_observers in 0usize..8) {
        let cache = QueryCache::new(Duration::from_secs(60));
        let query = cache.get_or_create(QueryKey::from(["retry-race"])).unwrap();

        let first = RetryConfig { max_attempts: 1, ..RetryConfig::default() };
        let fetcher: async_query::query::ErasedFetcher = Arc::new(|_ctx| {
            Box::pin(async { Ok(Arc::new(1i32) as async_query::query::ErasedData) })
        });
        query.add_observer(ObserverId::new(), fetcher.clone(), first.clone());

        for _ in 0..extra_observers {
            let later = RetryConfig { max_attempts: 9, ..RetryConfig::default() };
            query.add_observer(ObserverId::new(), fetcher.clone(), later);
        }

        prop_assert_eq!(query.retry_config().max_attempts, 1);
    }
}
