//! Orchestrates when a fetch may run at all, then hands off to
//! [`Query::ensure_fetch`] for the single-flight/retry mechanics.
//!
//! Adds the `networkMode`/paused-`fetchStatus` behaviour from §C of the
//! expanded spec, grounded in spirit (not machinery) on the teacher's
//! `sync::NetworkStatus`.

use crate::query::{ErasedData, ErasedFetcher, Query};
use crate::retry::{QueryError, RetryConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// How a query's fetches relate to connectivity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkMode {
    /// Only fetch while online; otherwise the query sits `paused`.
    Online,
    /// Always attempt to fetch, online or not.
    Always,
    /// Fetch immediately if online; if offline, wait for reconnect before
    /// the first attempt, but don't pause a retry loop already running.
    OfflineFirst,
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::Online
    }
}

/// Reports whether the process currently considers itself online. Injected
/// so tests and non-browser embedders can control it directly instead of
/// this crate guessing at a platform API.
pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Always-online monitor, the default for native/server use.
#[derive(Default)]
pub struct AlwaysOnline;

impl ConnectivityMonitor for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// A monitor whose state tests can flip at will.
#[derive(Default)]
pub struct ManualConnectivity {
    online: AtomicBool,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Stateless entry point used by `Observer`/`QueryClient` to run a fetch,
/// respecting `NetworkMode` before delegating to the query's single-flight
/// lease.
pub struct FetchCoordinator {
    connectivity: Arc<dyn ConnectivityMonitor>,
}

impl FetchCoordinator {
    pub fn new(connectivity: Arc<dyn ConnectivityMonitor>) -> Self {
        Self { connectivity }
    }

    pub fn online() -> Self {
        Self::new(Arc::new(AlwaysOnline))
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Run (or join) a fetch for `query`, subject to `mode`. When offline
    /// under `NetworkMode::Online` (or `OfflineFirst` on its first attempt),
    /// the query transitions to `fetch_status == Paused` and this returns
    /// `Err(QueryError::Paused)` rather than ever calling the query
    /// function — callers that need to block until connectivity returns
    /// should poll `subscribe_state` instead of retrying this call.
    pub async fn fetch(
        &self,
        query: &Arc<Query>,
        query_fn: Option<ErasedFetcher>,
        retry: Option<RetryConfig>,
        force: bool,
        mode: NetworkMode,
    ) -> Result<ErasedData, QueryError> {
        if mode != NetworkMode::Always && !self.connectivity.is_online() {
            query.set_paused();
            return Err(QueryError::Paused);
        }
        query.ensure_fetch(query_fn, retry, force).await
    }
}

/// Guards a single "wait for reconnect then fetch" sequence, used by
/// `OfflineFirst` queries that started while offline.
pub struct PendingOnReconnect {
    waiting: Mutex<bool>,
}

impl Default for PendingOnReconnect {
    fn default() -> Self {
        Self {
            waiting: Mutex::new(false),
        }
    }
}

impl PendingOnReconnect {
    pub fn mark_waiting(&self) {
        *self.waiting.lock().unwrap() = true;
    }

    pub fn take_if_waiting(&self) -> bool {
        let mut guard = self.waiting.lock().unwrap();
        std::mem::replace(&mut *guard, false)
    }
}

/// A signal an `Observer` can opt into refetching on: the window/app
/// regaining focus, or connectivity coming back after a drop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalEvent {
    WindowFocus,
    Reconnect,
}

/// Source of focus/reconnect notifications. An embedder wires platform
/// events (a browser's `visibilitychange`/`online`, or a native app's
/// equivalent) into a `ManualExternalEvents`; `NoExternalEvents` is the
/// default for contexts with no such signal (e.g. a server process).
pub trait ExternalEvents: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ExternalEvent>;
}

/// Never fires. The default for `QueryClient`, so
/// `refetch_on_window_focus`/`refetch_on_reconnect` are inert unless an
/// embedder supplies a real source.
pub struct NoExternalEvents {
    tx: broadcast::Sender<ExternalEvent>,
}

impl Default for NoExternalEvents {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self { tx }
    }
}

impl ExternalEvents for NoExternalEvents {
    fn subscribe(&self) -> broadcast::Receiver<ExternalEvent> {
        self.tx.subscribe()
    }
}

/// A source tests (or an embedder without a platform event loop) can fire
/// directly.
pub struct ManualExternalEvents {
    tx: broadcast::Sender<ExternalEvent>,
}

impl Default for ManualExternalEvents {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self { tx }
    }
}

impl ManualExternalEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire_window_focus(&self) {
        let _ = self.tx.send(ExternalEvent::WindowFocus);
    }

    pub fn fire_reconnect(&self) {
        let _ = self.tx.send(ExternalEvent::Reconnect);
    }
}

impl ExternalEvents for ManualExternalEvents {
    fn subscribe(&self) -> broadcast::Receiver<ExternalEvent> {
        self.tx.subscribe()
    }
}
