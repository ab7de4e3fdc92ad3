//! Persisting cache entries across process restarts: the `Persister`
//! trait, the JSON record shape, and the manager that wires writes through
//! on successful fetches.
//!
//! Grounded on the teacher's `persistence::StorageBackend` /
//! `PersistenceManager` (trait-object backend, `MemoryBackend` default,
//! `instant_serde`-style timestamp shim), reshaped around the spec's
//! `Persister` surface (`persistQuery`/`restoreQuery`/`restoreAll`/
//! `removeQuery`/`removeQueries`/`clear`/`close`) and first-observer-wins
//! persist-option precedence.

use crate::key::{QueryHash, QueryKey};
use crate::state::QueryStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum PersistError {
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The on-disk/on-wire shape of one persisted query (§6.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedQuery {
    pub hash: String,
    pub query_key: QueryKey,
    pub data: serde_json::Value,
    pub data_updated_at: DateTime<Utc>,
    pub persisted_at: DateTime<Utc>,
    pub status: PersistedStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistedStatus {
    Pending,
    Success,
    Error,
}

impl From<QueryStatus> for PersistedStatus {
    fn from(status: QueryStatus) -> Self {
        match status {
            QueryStatus::Pending => PersistedStatus::Pending,
            QueryStatus::Success => PersistedStatus::Success,
            QueryStatus::Error => PersistedStatus::Error,
        }
    }
}

impl From<PersistedStatus> for QueryStatus {
    fn from(status: PersistedStatus) -> Self {
        match status {
            PersistedStatus::Pending => QueryStatus::Pending,
            PersistedStatus::Success => QueryStatus::Success,
            PersistedStatus::Error => QueryStatus::Error,
        }
    }
}

/// Converts a typed value to/from the opaque JSON carried in
/// [`PersistedQuery::data`]. The default `JsonSerializer` just delegates to
/// `serde_json`; callers needing compression or encryption swap this trait
/// per key, the way the teacher's `PersistenceConfig` exposed `compress`/
/// `encryption_key` knobs on `MemoryBackend`.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<serde_json::Value, PersistError>;
    fn deserialize(&self, value: serde_json::Value) -> Result<T, PersistError>;
}

pub struct JsonSerializer;

impl<T: Serialize + DeserializeOwned> Serializer<T> for JsonSerializer {
    fn serialize(&self, value: &T) -> Result<serde_json::Value, PersistError> {
        serde_json::to_value(value).map_err(|e| PersistError::Serialize(e.to_string()))
    }

    fn deserialize(&self, value: serde_json::Value) -> Result<T, PersistError> {
        serde_json::from_value(value).map_err(|e| PersistError::Deserialize(e.to_string()))
    }
}

/// Storage backend abstraction; `MemoryPersister` is the default, an
/// embedder provides e.g. a sled- or file-backed one for real durability.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn persist_query(&self, record: PersistedQuery) -> Result<(), PersistError>;
    async fn restore_query(&self, hash: &str) -> Result<Option<PersistedQuery>, PersistError>;
    async fn restore_all(&self) -> Result<Vec<PersistedQuery>, PersistError>;
    async fn remove_query(&self, hash: &str) -> Result<(), PersistError>;
    async fn remove_queries(&self, hashes: &[String]) -> Result<(), PersistError>;
    async fn clear(&self) -> Result<(), PersistError>;
    async fn close(&self) -> Result<(), PersistError>;
}

/// In-memory `Persister`, analogous to the teacher's `MemoryBackend`.
/// Useful as the default and in tests; doesn't outlive the process.
#[derive(Default)]
pub struct MemoryPersister {
    records: RwLock<HashMap<String, PersistedQuery>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn persist_query(&self, record: PersistedQuery) -> Result<(), PersistError> {
        self.records.write().insert(record.hash.clone(), record);
        Ok(())
    }

    async fn restore_query(&self, hash: &str) -> Result<Option<PersistedQuery>, PersistError> {
        Ok(self.records.read().get(hash).cloned())
    }

    async fn restore_all(&self) -> Result<Vec<PersistedQuery>, PersistError> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn remove_query(&self, hash: &str) -> Result<(), PersistError> {
        self.records.write().remove(hash);
        Ok(())
    }

    async fn remove_queries(&self, hashes: &[String]) -> Result<(), PersistError> {
        let mut records = self.records.write();
        for hash in hashes {
            records.remove(hash);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), PersistError> {
        self.records.write().clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Per-key persistence configuration. The first observer to register
/// persistence for a given hash wins; later registrations for the same
/// hash are ignored, mirroring retry-config precedence.
#[derive(Clone)]
pub struct PersistOptions {
    pub max_age: std::time::Duration,
    pub key_prefix: Option<String>,
    /// Whether a record that fails to deserialize back into its `T` (e.g.
    /// after a breaking shape change) is dropped from the backend rather
    /// than left to fail again on every future restore. Defaults to `true`.
    pub remove_on_deserialization_error: bool,
    /// Per-key override of the serializer used for this query's data.
    /// Stored type-erased (as `Arc<dyn Serializer<T>>` behind a second
    /// `Arc<dyn Any>`) and downcast back to the concrete wrapped trait
    /// object at the exact `T` the caller registered it for.
    serializer: Option<Arc<dyn Any + Send + Sync>>,
}

impl PersistOptions {
    /// Use a custom [`Serializer<T>`] for this key instead of the default
    /// `JsonSerializer`.
    pub fn with_serializer<T: Send + Sync + 'static>(
        mut self,
        serializer: Arc<dyn Serializer<T>>,
    ) -> Self {
        self.serializer = Some(Arc::new(serializer) as Arc<dyn Any + Send + Sync>);
        self
    }
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            max_age: std::time::Duration::from_secs(24 * 60 * 60),
            key_prefix: None,
            remove_on_deserialization_error: true,
            serializer: None,
        }
    }
}

impl std::fmt::Debug for PersistOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistOptions")
            .field("max_age", &self.max_age)
            .field("key_prefix", &self.key_prefix)
            .field(
                "remove_on_deserialization_error",
                &self.remove_on_deserialization_error,
            )
            .field("serializer", &self.serializer.is_some().then_some("<custom>"))
            .finish()
    }
}

/// Orchestrates write-through persistence and hydrate/dehydrate.
pub struct PersistenceManager {
    persister: Box<dyn Persister>,
    options: RwLock<HashMap<QueryHash, PersistOptions>>,
}

impl PersistenceManager {
    pub fn new(persister: Box<dyn Persister>) -> Self {
        Self {
            persister,
            options: RwLock::new(HashMap::new()),
        }
    }

    pub fn memory() -> Self {
        Self::new(Box::new(MemoryPersister::new()))
    }

    /// Register persistence for `hash`, first-observer-wins.
    pub fn register(&self, hash: QueryHash, options: PersistOptions) {
        self.options.write().entry(hash).or_insert(options);
    }

    pub fn is_registered(&self, hash: &QueryHash) -> bool {
        self.options.read().contains_key(hash)
    }

    /// Whether a record failing to deserialize for `hash` should be dropped
    /// from the backend, per its registered options (or the default of
    /// `true` if `hash` was never registered).
    pub fn removes_on_deserialization_error(&self, hash: &QueryHash) -> bool {
        self.options
            .read()
            .get(hash)
            .map(|o| o.remove_on_deserialization_error)
            .unwrap_or(true)
    }

    fn record_hash(&self, hash: &QueryHash) -> String {
        let options = self.options.read();
        match options.get(hash) {
            Some(opt) => hash.with_prefix(opt.key_prefix.as_deref()),
            None => hash.as_str().to_string(),
        }
    }

    /// The registered serializer for `hash`'s `T`, if the caller configured
    /// one and it was registered for this exact `T`; `None` falls back to
    /// `JsonSerializer`.
    fn serializer_for<T: Serialize + DeserializeOwned + Send + Sync + 'static>(
        &self,
        hash: &QueryHash,
    ) -> Option<Arc<dyn Serializer<T>>> {
        let options = self.options.read();
        let erased = options.get(hash)?.serializer.clone()?;
        erased.downcast::<Arc<dyn Serializer<T>>>().ok().map(|b| (*b).clone())
    }

    pub async fn persist<T: Serialize + DeserializeOwned + Send + Sync + 'static>(
        &self,
        hash: &QueryHash,
        key: &QueryKey,
        status: QueryStatus,
        data: &T,
    ) -> Result<(), PersistError> {
        if !self.is_registered(hash) {
            return Ok(());
        }
        let value = match self.serializer_for::<T>(hash) {
            Some(s) => s.serialize(data)?,
            None => JsonSerializer.serialize(data)?,
        };
        let now = Utc::now();
        let record = PersistedQuery {
            hash: self.record_hash(hash),
            query_key: key.clone(),
            data: value,
            data_updated_at: now,
            persisted_at: now,
            status: status.into(),
        };
        self.persister.persist_query(record).await
    }

    /// Deserialize `value` using `hash`'s registered serializer, falling
    /// back to plain JSON. Shared by `restore` and hydrate's raw materialize
    /// pass.
    pub fn deserialize<T: Serialize + DeserializeOwned + Send + Sync + 'static>(
        &self,
        hash: &QueryHash,
        value: serde_json::Value,
    ) -> Result<T, PersistError> {
        match self.serializer_for::<T>(hash) {
            Some(s) => s.deserialize(value),
            None => JsonSerializer.deserialize(value),
        }
    }

    fn max_age_for(&self, hash: &QueryHash) -> std::time::Duration {
        self.options
            .read()
            .get(hash)
            .map(|o| o.max_age)
            .unwrap_or(std::time::Duration::from_secs(24 * 60 * 60))
    }

    /// Whether `record`'s `data_updated_at` is still within `hash`'s
    /// registered `max_age` (or the default if unregistered).
    pub fn is_within_max_age(&self, hash: &QueryHash, record: &PersistedQuery) -> bool {
        let max_age = self.max_age_for(hash);
        let age = Utc::now().signed_duration_since(record.data_updated_at);
        age.num_seconds() >= 0 && (age.num_seconds() as u64) <= max_age.as_secs()
    }

    pub async fn restore<T: Serialize + DeserializeOwned + Send + Sync + 'static>(
        &self,
        hash: &QueryHash,
    ) -> Result<Option<T>, PersistError> {
        let record_hash = self.record_hash(hash);
        let record = self.persister.restore_query(&record_hash).await?;
        match record {
            None => Ok(None),
            Some(record) => {
                if !self.is_within_max_age(hash, &record) {
                    tracing::debug!(%hash, "discarding persisted record past max age");
                    return Ok(None);
                }
                self.deserialize(hash, record.data).map(Some)
            }
        }
    }

    pub async fn remove(&self, hash: &QueryHash) -> Result<(), PersistError> {
        let record_hash = self.record_hash(hash);
        self.persister.remove_query(&record_hash).await
    }

    pub async fn clear(&self) -> Result<(), PersistError> {
        self.persister.clear().await
    }

    pub async fn close(&self) -> Result<(), PersistError> {
        self.persister.close().await
    }

    pub async fn restore_all(&self) -> Result<Vec<PersistedQuery>, PersistError> {
        self.persister.restore_all().await
    }

    /// Writes an already-built record straight through to the backend,
    /// used by `dehydrate` to snapshot the live cache into durable storage.
    pub async fn persist_record(&self, record: PersistedQuery) -> Result<(), PersistError> {
        self.persister.persist_query(record).await
    }

    pub async fn remove_record_hash(&self, record_hash: &str) -> Result<(), PersistError> {
        self.persister.remove_query(record_hash).await
    }
}
