//! Mutations: one-shot writes with optimistic updates, rollback, and
//! query invalidation on settle.
//!
//! Grounded on the teacher's `mutation::use_mutation` (onMutate → mutationFn
//! → onSuccess/onError → onSettled ordering) and
//! `mutation::use_optimistic_mutation` (rollback via the context returned
//! from `on_mutate`), folded into one `Mutation` type rather than the
//! teacher's separate optimistic-manager module — the spec keeps rollback
//! context scoped to a single mutation's `onMutate` return value, not a
//! global manager.

use crate::key::QueryKeyPattern;
use crate::query::BoxFuture;
use crate::retry::{execute_with_retry, QueryError, RetryConfig};
use crate::cancellation::CancellationSignal;
use crate::state::MutationStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MutationId(Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback bundle and policy for a [`Mutation`]. `TContext` carries
/// whatever `on_mutate` hands back (typically a rollback snapshot) to
/// `on_error`/`on_settled`.
pub struct MutationOptions<TData, TVariables, TContext> {
    pub retry: RetryConfig,
    pub invalidates: Vec<QueryKeyPattern>,
    #[allow(clippy::type_complexity)]
    pub on_mutate:
        Option<Arc<dyn Fn(&TVariables) -> BoxFuture<Option<TContext>> + Send + Sync>>,
    #[allow(clippy::type_complexity)]
    pub on_success:
        Option<Arc<dyn Fn(&TData, &TVariables, Option<&TContext>) + Send + Sync>>,
    #[allow(clippy::type_complexity)]
    pub on_error:
        Option<Arc<dyn Fn(&QueryError, &TVariables, Option<&TContext>) + Send + Sync>>,
    #[allow(clippy::type_complexity)]
    pub on_settled: Option<
        Arc<dyn Fn(Option<&TData>, Option<&QueryError>, &TVariables, Option<&TContext>) + Send + Sync>,
    >,
}

impl<TData, TVariables, TContext> Default for MutationOptions<TData, TVariables, TContext> {
    fn default() -> Self {
        Self {
            retry: RetryConfig::none(),
            invalidates: Vec::new(),
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

/// Snapshot of a mutation's lifecycle, published after every transition.
#[derive(Clone)]
pub struct MutationState<TData> {
    pub status: MutationStatus,
    pub data: Option<Arc<TData>>,
    pub error: Option<QueryError>,
}

impl<TData> Default for MutationState<TData> {
    fn default() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        }
    }
}

type MutationFn<TData, TVariables> =
    Arc<dyn Fn(TVariables, CancellationSignal) -> BoxFuture<Result<TData, QueryError>> + Send + Sync>;

type InvalidateFn = Arc<dyn Fn(&[QueryKeyPattern]) + Send + Sync>;
type RecordFn = Arc<dyn Fn(bool) + Send + Sync>;

/// A reusable mutation definition. `mutate` can be called repeatedly, each
/// call running the full onMutate → fn → onSuccess/onError → onSettled →
/// invalidate sequence independently.
pub struct Mutation<TData, TVariables, TContext> {
    pub id: MutationId,
    mutation_fn: MutationFn<TData, TVariables>,
    options: MutationOptions<TData, TVariables, TContext>,
    invalidate: Option<InvalidateFn>,
    record: Option<RecordFn>,
    state: RwLock<MutationState<TData>>,
}

impl<TData, TVariables, TContext> Mutation<TData, TVariables, TContext>
where
    TData: Send + Sync + 'static,
    TVariables: Clone + Send + Sync + 'static,
    TContext: Send + Sync + 'static,
{
    pub fn new<F, Fut>(
        mutation_fn: F,
        options: MutationOptions<TData, TVariables, TContext>,
        invalidate: Option<InvalidateFn>,
    ) -> Arc<Self>
    where
        F: Fn(TVariables, CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<TData, QueryError>> + Send + 'static,
    {
        Self::with_recorder(mutation_fn, options, invalidate, None)
    }

    pub(crate) fn with_recorder<F, Fut>(
        mutation_fn: F,
        options: MutationOptions<TData, TVariables, TContext>,
        invalidate: Option<InvalidateFn>,
        record: Option<RecordFn>,
    ) -> Arc<Self>
    where
        F: Fn(TVariables, CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<TData, QueryError>> + Send + 'static,
    {
        Arc::new(Self {
            id: MutationId::new(),
            mutation_fn: Arc::new(move |vars, signal| Box::pin(mutation_fn(vars, signal))),
            options,
            invalidate,
            record,
            state: RwLock::new(MutationState::default()),
        })
    }

    pub fn state(&self) -> MutationState<TData> {
        self.state.read().unwrap().clone()
    }

    /// Run one mutation attempt to completion, per §4.9's ordering.
    pub async fn mutate(&self, variables: TVariables) -> Result<Arc<TData>, QueryError> {
        {
            let mut state = self.state.write().unwrap();
            state.status = MutationStatus::Loading;
            state.error = None;
        }

        let context = match &self.options.on_mutate {
            Some(cb) => cb(&variables).await,
            None => None,
        };

        let signal = CancellationSignal::new();
        let mutation_fn = self.mutation_fn.clone();
        let vars_for_fn = variables.clone();
        let result: Result<Arc<TData>, QueryError> =
            execute_with_retry(&self.options.retry, &signal, move |_ctx| {
                mutation_fn(vars_for_fn.clone(), signal.clone())
            })
            .await
            .map(Arc::new);

        match &result {
            Ok(data) => {
                if let Some(cb) = &self.options.on_success {
                    cb(data, &variables, context.as_ref());
                }
            }
            Err(err) => {
                if let Some(cb) = &self.options.on_error {
                    cb(err, &variables, context.as_ref());
                }
            }
        }
        if let Some(cb) = &self.options.on_settled {
            cb(
                result.as_ref().ok().map(|d| d.as_ref()),
                result.as_ref().err(),
                &variables,
                context.as_ref(),
            );
        }
        if result.is_ok() {
            if let Some(invalidate) = &self.invalidate {
                invalidate(&self.options.invalidates);
            }
        }
        if let Some(record) = &self.record {
            record(result.is_ok());
        }

        {
            let mut state = self.state.write().unwrap();
            match &result {
                Ok(data) => {
                    state.status = MutationStatus::Success;
                    state.data = Some(data.clone());
                }
                Err(err) => {
                    state.status = MutationStatus::Error;
                    state.error = Some(err.clone());
                }
            }
        }

        result
    }

    pub fn reset(&self) {
        *self.state.write().unwrap() = MutationState::default();
    }
}

/// Lightweight counters across all mutations run through one client,
/// mirroring `QueryCache::cache_stats` for the mutation side.
#[derive(Default)]
pub struct MutationCache {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl MutationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> MutationCacheStats {
        MutationCacheStats {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutationCacheStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}
