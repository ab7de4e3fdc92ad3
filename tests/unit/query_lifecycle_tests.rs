//! Unit tests for query lifecycle and state transitions.

#[path = "../utils/mod.rs"]
mod utils;

use async_query::{
    FetchContext, ObserverOptions, QueryClient, QueryClientConfig, QueryError, QueryKey,
    QueryStatus, RefetchOnMount, RetryConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use utils::TestUser;

fn user(id: u32) -> TestUser {
    TestUser {
        id,
        name: format!("user-{id}"),
        email: format!("user-{id}@example.com"),
    }
}

#[tokio::test]
async fn starts_pending_then_transitions_to_success() {
    let client = QueryClient::new(QueryClientConfig::default());
    let observer = client.build_query(
        QueryKey::from(["users", "1"]),
        |_ctx: FetchContext| async { Ok(user(1)) },
        ObserverOptions::default(),
    );

    let initial = observer.result().unwrap();
    assert!(initial.is_pending() || initial.is_success());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let settled = observer.result().unwrap();
    assert!(settled.is_success());
    assert_eq!(settled.data.unwrap().id, 1);
}

#[tokio::test]
async fn failing_fetch_reaches_error_status() {
    let client = QueryClient::new(QueryClientConfig::default());
    let options = ObserverOptions {
        retry: RetryConfig::none(),
        ..ObserverOptions::default()
    };
    let observer = client.build_query(
        QueryKey::from(["users", "missing"]),
        |_ctx: FetchContext| async { Err(QueryError::custom("not found")) },
        options,
    );

    tokio::time::sleep(Duration::from_millis(30)).await;
    let state = observer.result().unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.fetch_failure_count, 1);
}

#[tokio::test]
async fn refetch_forces_a_new_fetch_even_when_fresh() {
    let client = QueryClient::new(QueryClientConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = calls.clone();
    let observer = client.build_query(
        QueryKey::from(["users", "1"]),
        move |_ctx: FetchContext| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(user(1))
            }
        },
        ObserverOptions::default(),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    observer.refetch().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_observer_never_fetches_until_manually_refetched() {
    let client = QueryClient::new(QueryClientConfig::default());
    let options = ObserverOptions {
        enabled: false,
        ..ObserverOptions::default()
    };
    let observer = client.build_query(
        QueryKey::from(["users", "1"]),
        |_ctx: FetchContext| async { Ok(user(1)) },
        options,
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(observer.result().unwrap().is_pending());

    observer.refetch().await.unwrap();
    assert!(observer.result().unwrap().is_success());
}

#[tokio::test]
async fn refetch_on_mount_never_skips_initial_fetch() {
    let client = QueryClient::new(QueryClientConfig::default());
    let options = ObserverOptions {
        refetch_on_mount: RefetchOnMount::Never,
        ..ObserverOptions::default()
    };
    let observer = client.build_query(
        QueryKey::from(["users", "1"]),
        |_ctx: FetchContext| async { Ok(user(1)) },
        options,
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(observer.result().unwrap().is_pending());
}
