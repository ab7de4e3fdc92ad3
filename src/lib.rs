//! A type-safe, async data fetching, caching, and synchronization engine
//! for Rust clients: the server-state half of an application, independent
//! of any particular UI framework.
//!
//! The moving parts, bottom-up:
//!
//! - [`key`] — canonical [`key::QueryKey`] encoding and hashing.
//! - [`cancellation`] — cooperative [`cancellation::CancellationSignal`]s.
//! - [`retry`] — [`retry::QueryError`] and [`retry::RetryConfig`] backoff.
//! - [`state`] — [`state::QueryState`] and the type-erased snapshot it's
//!   downcast from.
//! - [`query`] — [`query::Query`], one cache entry's state machine and
//!   single-flight fetch lease.
//! - [`cache`] — [`cache::QueryCache`], the indexed collection of queries.
//! - [`fetch`] — [`fetch::FetchCoordinator`], network-mode-aware fetch
//!   dispatch.
//! - [`observer`] — [`observer::Observer`], the typed subscription layer.
//! - [`infinite`] — [`infinite::InfiniteObserver`], paginated queries.
//! - [`mutation`] — [`mutation::Mutation`], one-shot writes with rollback.
//! - [`persistence`] — [`persistence::PersistenceManager`], write-through
//!   persistence and hydrate/dehydrate.
//! - [`client`] — [`client::QueryClient`], the application-facing facade.

pub mod cache;
pub mod cancellation;
pub mod client;
pub mod fetch;
pub mod infinite;
pub mod key;
pub mod mutation;
pub mod observer;
pub mod persistence;
pub mod query;
pub mod retry;
pub mod state;

pub use cache::{CacheEvent, CacheStats, QueryCache};
pub use cancellation::{CancellationSignal, FetchContext};
pub use client::{QueryClient, QueryClientConfig};
pub use fetch::{
    ConnectivityMonitor, ExternalEvent, ExternalEvents, FetchCoordinator, ManualExternalEvents,
    NetworkMode, NoExternalEvents,
};
pub use infinite::{InfiniteData, InfiniteObserver, InfiniteQueryOptions, Page};
pub use key::{KeyPart, QueryHash, QueryKey, QueryKeyPattern};
pub use mutation::{Mutation, MutationCache, MutationId, MutationOptions, MutationState};
pub use observer::{Observer, ObserverOptions, RefetchOnMount};
pub use persistence::{
    JsonSerializer, MemoryPersister, PersistError, PersistOptions, PersistedQuery,
    PersistedStatus, PersistenceManager, Persister, Serializer,
};
pub use query::{ObserverId, Query};
pub use retry::{execute_with_retry, ErrorSeverity, QueryError, RetryConfig, RetryDelay};
pub use state::{FetchStatus, MutationStatus, QueryMeta, QueryState, QueryStatus, RawQueryState};
