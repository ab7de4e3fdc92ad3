//! Tests for `Mutation`'s onMutate/onSuccess/onError/onSettled lifecycle,
//! rollback context threading, and retry behavior.

#[path = "../utils/mod.rs"]
mod utils;

use async_query::{
    CancellationSignal, MutationOptions, MutationStatus, QueryError, RetryConfig, RetryDelay,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use utils::TestUser;

fn rename(id: u32, name: &str) -> TestUser {
    TestUser {
        id,
        name: name.to_string(),
        email: format!("user-{id}@example.com"),
    }
}

#[tokio::test]
async fn successful_mutation_runs_on_mutate_then_on_success_then_on_settled() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_mutate = order.clone();
    let order_success = order.clone();
    let order_settled = order.clone();

    let options: MutationOptions<TestUser, u32, String> = MutationOptions {
        on_mutate: Some(Arc::new(move |_vars: &u32| {
            let order = order_mutate.clone();
            Box::pin(async move {
                order.lock().unwrap().push("mutate");
                Some("rollback-context".to_string())
            })
        })),
        on_success: Some(Arc::new(move |_data, _vars, ctx| {
            order_success.lock().unwrap().push("success");
            assert_eq!(ctx, Some(&"rollback-context".to_string()));
        })),
        on_settled: Some(Arc::new(move |_data, _err, _vars, _ctx| {
            order_settled.lock().unwrap().push("settled");
        })),
        ..MutationOptions::default()
    };

    let mutation = async_query::Mutation::new(
        |id: u32, _signal: CancellationSignal| async move { Ok(rename(id, "Renamed")) },
        options,
        None,
    );

    let result = mutation.mutate(1).await.unwrap();
    assert_eq!(result.name, "Renamed");
    assert_eq!(
        *order.lock().unwrap(),
        vec!["mutate", "success", "settled"]
    );
    assert_eq!(mutation.state().status, MutationStatus::Success);
}

#[tokio::test]
async fn failed_mutation_runs_on_error_and_rolls_back_via_context() {
    let rolled_back = Arc::new(AtomicBool::new(false));
    let rolled_back2 = rolled_back.clone();

    let options: MutationOptions<TestUser, u32, String> = MutationOptions {
        on_mutate: Some(Arc::new(|_vars: &u32| {
            Box::pin(async { Some("previous-value".to_string()) })
        })),
        on_error: Some(Arc::new(move |_err, _vars, ctx| {
            assert_eq!(ctx, Some(&"previous-value".to_string()));
            rolled_back2.store(true, Ordering::SeqCst);
        })),
        retry: RetryConfig::none(),
        ..MutationOptions::default()
    };

    let mutation = async_query::Mutation::new(
        |_id: u32, _signal: CancellationSignal| async {
            Err::<TestUser, _>(QueryError::custom("rename rejected"))
        },
        options,
        None,
    );

    let result = mutation.mutate(1).await;
    assert!(result.is_err());
    assert!(rolled_back.load(Ordering::SeqCst));
    assert_eq!(mutation.state().status, MutationStatus::Error);
}

#[tokio::test]
async fn mutation_retries_transient_failures_before_succeeding() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = attempts.clone();

    let options: MutationOptions<TestUser, u32, ()> = MutationOptions {
        retry: RetryConfig {
            max_attempts: 4,
            delay: RetryDelay::Fixed(Duration::from_millis(5)),
            jitter: false,
        },
        ..MutationOptions::default()
    };
    let mutation = async_query::Mutation::new(
        move |id: u32, _signal: CancellationSignal| {
            let attempts = attempts2.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(QueryError::network("flaky upstream"));
                }
                Ok(rename(id, "Eventually Renamed"))
            }
        },
        options,
        None,
    );

    let result = mutation.mutate(7).await.unwrap();
    assert_eq!(result.name, "Eventually Renamed");
    assert!(attempts.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn non_retryable_error_does_not_retry() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = attempts.clone();
    let options: MutationOptions<TestUser, u32, ()> = MutationOptions {
        retry: RetryConfig {
            max_attempts: 5,
            delay: RetryDelay::Fixed(Duration::from_millis(5)),
            jitter: false,
        },
        ..MutationOptions::default()
    };
    let mutation = async_query::Mutation::new(
        move |_id: u32, _signal: CancellationSignal| {
            let attempts = attempts2.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<TestUser, _>(QueryError::custom("validation failed"))
            }
        },
        options,
        None,
    );

    assert!(mutation.mutate(1).await.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reset_clears_state_back_to_idle() {
    let options: MutationOptions<TestUser, u32, ()> = MutationOptions::default();
    let mutation = async_query::Mutation::new(
        |id: u32, _signal: CancellationSignal| async move { Ok(rename(id, "X")) },
        options,
        None,
    );
    mutation.mutate(1).await.unwrap();
    assert_eq!(mutation.state().status, MutationStatus::Success);
    mutation.reset();
    assert_eq!(mutation.state().status, MutationStatus::Idle);
    assert!(mutation.state().data.is_none());
}

#[tokio::test]
async fn repeated_calls_to_mutate_run_independently() {
    let options: MutationOptions<TestUser, u32, ()> = MutationOptions::default();
    let mutation = async_query::Mutation::new(
        |id: u32, _signal: CancellationSignal| async move { Ok(rename(id, "Repeat")) },
        options,
        None,
    );
    let first = mutation.mutate(1).await.unwrap();
    let second = mutation.mutate(2).await.unwrap();
    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
}
