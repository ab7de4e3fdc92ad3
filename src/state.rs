//! Query and mutation status vocabulary, and the type-erased snapshot a
//! `Query` publishes internally.
//!
//! Cached data is held as `Arc<dyn Any + Send + Sync>` rather than a generic
//! parameter on `Query` itself, since a single `QueryCache` holds queries of
//! many unrelated result types at once. Callers downcast back to their own
//! `T` at the `Observer<T>` boundary, where the type is statically known.

use crate::retry::QueryError;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

/// Coarse lifecycle status of a query's data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
}

/// Whether a query is currently doing network work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
    Paused,
}

/// A query's data slot. Usually `Typed` — a live value an `Observer<T>` can
/// downcast directly. `Raw` holds an opaque JSON blob restored from
/// persistence before any observer with a concrete `T` has attached yet;
/// `QueryClient::build_query` deserializes it into `Typed` the first time
/// that happens.
#[derive(Clone)]
pub enum DataSlot {
    Typed(Arc<dyn Any + Send + Sync>),
    Raw(serde_json::Value),
}

/// Type-erased immutable snapshot of a `Query`'s state. `Observer<T>`
/// downcasts `data` into `Arc<T>` to build the public [`QueryState`].
#[derive(Clone)]
pub struct RawQueryState {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub data: Option<DataSlot>,
    pub data_updated_at: Option<Instant>,
    pub error: Option<QueryError>,
    pub error_updated_at: Option<Instant>,
    pub fetch_failure_count: u32,
    pub is_invalidated: bool,
}

impl RawQueryState {
    pub fn new() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            data_updated_at: None,
            error: None,
            error_updated_at: None,
            fetch_failure_count: 0,
            is_invalidated: false,
        }
    }

    pub fn is_stale(&self, stale_time: std::time::Duration) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.data_updated_at {
            None => true,
            Some(t) => t.elapsed() >= stale_time,
        }
    }

    /// Downcast (or, for a still-`Raw` slot, deserialize) `data` into `T`.
    /// Used by cache reads that bypass `Observer` (`QueryClient::get_query_data`),
    /// where a hydrated-but-never-observed record can still be sitting as `Raw`.
    pub fn typed_data<T: DeserializeOwned + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        match &self.data {
            None => None,
            Some(DataSlot::Typed(d)) => Arc::downcast::<T>(d.clone()).ok(),
            Some(DataSlot::Raw(v)) => serde_json::from_value::<T>(v.clone()).ok().map(Arc::new),
        }
    }
}

impl Default for RawQueryState {
    fn default() -> Self {
        Self::new()
    }
}

/// The typed view of a query's state handed to observers, downcast from a
/// [`RawQueryState`] for a specific `T`.
#[derive(Clone)]
pub struct QueryState<T> {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub data: Option<Arc<T>>,
    pub data_updated_at: Option<Instant>,
    pub error: Option<QueryError>,
    pub error_updated_at: Option<Instant>,
    pub fetch_failure_count: u32,
    pub is_invalidated: bool,
    /// `data` is standing in for a not-yet-resolved fetch because
    /// `placeholderData` was configured.
    pub is_placeholder_data: bool,
    /// `data` is carried over from a previous key because `keepPreviousData`
    /// is enabled and this key's own fetch hasn't resolved yet.
    pub is_previous_data: bool,
}

impl<T: Send + Sync + 'static> QueryState<T> {
    /// Downcast a type-erased snapshot. Returns an error if `data` was
    /// populated by a different `T` than expected (caller misuse — reusing
    /// a key across incompatible types), or if it's still an opaque `Raw`
    /// blob nobody has deserialized yet.
    pub fn from_raw(raw: &RawQueryState) -> Result<Self, QueryError> {
        let data = match &raw.data {
            None => None,
            Some(DataSlot::Typed(d)) => Some(Arc::downcast::<T>(d.clone()).map_err(|_| {
                QueryError::TypeMismatch {
                    expected: std::any::type_name::<T>().to_string(),
                    actual: "<erased>".to_string(),
                }
            })?),
            Some(DataSlot::Raw(_)) => {
                return Err(QueryError::TypeMismatch {
                    expected: std::any::type_name::<T>().to_string(),
                    actual: "<raw, not yet deserialized>".to_string(),
                });
            }
        };
        Ok(Self {
            status: raw.status,
            fetch_status: raw.fetch_status,
            data,
            data_updated_at: raw.data_updated_at,
            error: raw.error.clone(),
            error_updated_at: raw.error_updated_at,
            fetch_failure_count: raw.fetch_failure_count,
            is_invalidated: raw.is_invalidated,
            is_placeholder_data: false,
            is_previous_data: false,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }
}

/// Status of a mutation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Running counters kept per `Query` for observability; not persisted.
#[derive(Clone, Debug, Default)]
pub struct QueryMeta {
    pub fetch_count: u64,
    pub error_count: u64,
    pub last_fetch_duration: Option<std::time::Duration>,
    pub total_fetch_time: std::time::Duration,
}

impl QueryMeta {
    pub fn record_fetch(&mut self, duration: std::time::Duration) {
        self.fetch_count += 1;
        self.last_fetch_duration = Some(duration);
        self.total_fetch_time += duration;
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub fn average_fetch_time(&self) -> Option<std::time::Duration> {
        if self.fetch_count == 0 {
            None
        } else {
            Some(self.total_fetch_time / self.fetch_count as u32)
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.fetch_count;
        if total == 0 {
            return 0.0;
        }
        (total - self.error_count) as f64 / total as f64
    }
}
