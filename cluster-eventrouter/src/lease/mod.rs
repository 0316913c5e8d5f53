//! Cluster-wide exclusive leases.
//!
//! A [`LeaseManager`] hands out one [`Lease`] handle per name and keeps every
//! held lease alive from a single renewal loop. Locally a lease only counts
//! as held until `ttl - safety_margin` after the last successful request was
//! *sent*, so a member cut off from the backend gives the lease up in its
//! own mind before the backend lets anyone else take it.

mod backend;
mod memory;
mod redis_backend;

pub use backend::{FencingToken, LeaseBackend};
pub use memory::InMemoryLeaseBackend;
pub use redis_backend::RedisLeaseBackend;

use crate::config::{ClusterConfig, LeaseBackendKind, LeaseConfig};
use crate::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Connectivity to the backend was lost while holding the lease.
    Unknown,
    NotHeld,
    Held,
    /// Terminal. Set by [`LeaseManager::release_all`].
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    Acquired(String),
    /// Renewal failed or the backend handed the lease to someone else.
    Lost(String),
    Released(String),
}

impl LeaseEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Acquired(name) | Self::Lost(name) | Self::Released(name) => name,
        }
    }
}

/// Callbacks run on the task that changed the lease state.
pub trait LeaseListener: Send + Sync {
    fn after_acquire(&self, _lease: &Lease) {}

    /// Called before a voluntary release and when the lease is lost.
    fn before_release(&self, _lease: &Lease) {}
}

#[derive(Debug, Clone, Copy)]
enum State {
    Unknown,
    NotHeld,
    Held {
        token: FencingToken,
        valid_until: Instant,
    },
    Closed,
}

struct Shared {
    holder_id: String,
    backend: Arc<dyn LeaseBackend>,
    config: LeaseConfig,
    ready: AtomicBool,
    not_ready_since: Mutex<Option<Instant>>,
    closed: AtomicBool,
    event_tx: broadcast::Sender<LeaseEvent>,
}

struct LeaseInner {
    name: String,
    shared: Arc<Shared>,
    state: Mutex<State>,
    // Serializes backend operations on this lease
    op_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<Arc<dyn LeaseListener>>>,
}

/// Handle to a named lease. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Lease {
    fn new(name: &str, shared: Arc<Shared>) -> Self {
        let state = if shared.closed.load(Ordering::Acquire) {
            State::Closed
        } else {
            State::NotHeld
        };
        Self {
            inner: Arc::new(LeaseInner {
                name: name.to_string(),
                shared,
                state: Mutex::new(state),
                op_lock: tokio::sync::Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn holder_id(&self) -> &str {
        &self.inner.shared.holder_id
    }

    pub fn ptr_eq(a: &Lease, b: &Lease) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn status(&self) -> LeaseStatus {
        match *self.inner.state.lock() {
            State::Held { valid_until, .. } if Instant::now() < valid_until => LeaseStatus::Held,
            State::Held { .. } | State::Unknown => LeaseStatus::Unknown,
            State::NotHeld => LeaseStatus::NotHeld,
            State::Closed => LeaseStatus::Closed,
        }
    }

    /// Purely local check. Never touches the backend.
    pub fn is_held(&self) -> bool {
        self.status() == LeaseStatus::Held
    }

    pub fn fencing_token(&self) -> Option<FencingToken> {
        match *self.inner.state.lock() {
            State::Held { token, valid_until } if Instant::now() < valid_until => Some(token),
            _ => None,
        }
    }

    fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Closed)
    }

    /// Register a listener. If the lease is already held, `after_acquire`
    /// is called immediately.
    pub fn add_listener(&self, listener: Arc<dyn LeaseListener>) {
        self.inner.listeners.lock().push(listener.clone());
        if self.is_held() {
            listener.after_acquire(self);
        }
    }

    /// Try to take the lease. Returns `true` if this process holds it
    /// afterwards.
    ///
    /// Fails fast (returns `false`) when the manager is not ready, the lease
    /// is closed, another member holds it, or the backend is unreachable.
    pub async fn acquire(&self) -> bool {
        let _op = self.inner.op_lock.lock().await;
        if self.is_held() {
            return true;
        }
        if self.is_closed() {
            return false;
        }
        let shared = &self.inner.shared;
        if !shared.ready.load(Ordering::Acquire) {
            tracing::debug!(lease = %self.inner.name, "Not ready, skipping acquisition");
            return false;
        }

        let sent_at = Instant::now();
        match shared
            .backend
            .try_acquire(&self.inner.name, &shared.holder_id, shared.config.ttl)
            .await
        {
            Ok(Some(token)) => {
                if shared.closed.load(Ordering::Acquire) {
                    // Manager closed while the request was in flight
                    if let Err(e) = shared.backend.release(&self.inner.name, &shared.holder_id).await {
                        tracing::warn!(lease = %self.inner.name, "Failed to release after close: {}", e);
                    }
                    return false;
                }
                self.grant(token, sent_at);
                true
            }
            Ok(None) => {
                tracing::debug!(lease = %self.inner.name, "Lease held by another member");
                self.set_state(State::NotHeld);
                false
            }
            Err(e) => {
                tracing::warn!(lease = %self.inner.name, "Lease acquisition failed: {}", e);
                self.set_state(State::Unknown);
                false
            }
        }
    }

    /// Like [`is_held`](Self::is_held), but when local state is `Unknown`
    /// it asks the backend whether this process still holds the lease and
    /// reclaims it if so. May perform a network round trip.
    pub async fn check_held(&self) -> bool {
        if self.is_held() {
            return true;
        }
        if self.status() != LeaseStatus::Unknown
            || !self.inner.shared.ready.load(Ordering::Acquire)
        {
            return false;
        }
        let _op = self.inner.op_lock.lock().await;
        if self.is_held() {
            return true;
        }
        if self.status() != LeaseStatus::Unknown {
            return false;
        }

        let shared = &self.inner.shared;
        let sent_at = Instant::now();
        match shared
            .backend
            .renew(&self.inner.name, &shared.holder_id, shared.config.ttl)
            .await
        {
            Ok(Some(token)) => {
                tracing::info!(lease = %self.inner.name, "Reclaimed lease still held in backend");
                self.grant(token, sent_at);
                true
            }
            Ok(None) => {
                self.set_state(State::NotHeld);
                false
            }
            Err(e) => {
                tracing::debug!(lease = %self.inner.name, "Lease check failed: {}", e);
                false
            }
        }
    }

    /// Give the lease up. Idempotent. Returns `false` only if the backend
    /// could not be reached, in which case the grant expires on its own.
    pub async fn release(&self) -> bool {
        let _op = self.inner.op_lock.lock().await;
        self.release_locked().await
    }

    async fn release_locked(&self) -> bool {
        let was_held = match *self.inner.state.lock() {
            State::NotHeld | State::Closed => return true,
            State::Held { .. } => true,
            State::Unknown => false,
        };
        if was_held {
            self.notify_before_release();
        }
        // Stop claiming the lease before the backend frees it
        self.set_state(State::NotHeld);

        let shared = &self.inner.shared;
        match shared.backend.release(&self.inner.name, &shared.holder_id).await {
            Ok(deleted) => {
                if deleted {
                    tracing::info!(lease = %self.inner.name, "Released lease");
                }
                if was_held {
                    let _ = shared.event_tx.send(LeaseEvent::Released(self.inner.name.clone()));
                }
                true
            }
            Err(e) => {
                tracing::warn!(lease = %self.inner.name, "Lease release failed: {}", e);
                self.set_state(State::Unknown);
                if was_held {
                    let _ = shared.event_tx.send(LeaseEvent::Released(self.inner.name.clone()));
                }
                false
            }
        }
    }

    async fn close(&self) {
        let _op = self.inner.op_lock.lock().await;
        self.release_locked().await;
        *self.inner.state.lock() = State::Closed;
    }

    async fn renew(&self) {
        let Ok(_op) = self.inner.op_lock.try_lock() else {
            return;
        };
        let valid_until = match *self.inner.state.lock() {
            State::Held { valid_until, .. } => valid_until,
            _ => return,
        };

        let shared = &self.inner.shared;
        let sent_at = Instant::now();
        let outcome = tokio::time::timeout(
            shared.config.renew_interval,
            shared.backend.renew(&self.inner.name, &shared.holder_id, shared.config.ttl),
        )
        .await;

        match outcome {
            Ok(Ok(Some(token))) => {
                self.set_state(State::Held {
                    token,
                    valid_until: sent_at + shared.config.local_validity(),
                });
                tracing::trace!(lease = %self.inner.name, "Renewed lease");
            }
            Ok(Ok(None)) => {
                tracing::warn!(lease = %self.inner.name, "Lease lost: expired or taken over");
                self.lose(State::NotHeld);
            }
            Ok(Err(e)) if Instant::now() >= valid_until => {
                tracing::warn!(lease = %self.inner.name, "Lease renewal failed past local validity: {}", e);
                self.lose(State::Unknown);
            }
            Err(_) if Instant::now() >= valid_until => {
                tracing::warn!(lease = %self.inner.name, "Lease renewal timed out past local validity");
                self.lose(State::Unknown);
            }
            Ok(Err(e)) => {
                tracing::warn!(lease = %self.inner.name, "Lease renewal failed, will retry: {}", e);
            }
            Err(_) => {
                tracing::warn!(lease = %self.inner.name, "Lease renewal timed out, will retry");
            }
        }
    }

    fn grant(&self, token: FencingToken, sent_at: Instant) {
        let valid_until = sent_at + self.inner.shared.config.local_validity();
        let newly = {
            let mut state = self.inner.state.lock();
            if matches!(*state, State::Closed) {
                return;
            }
            let newly = !matches!(*state, State::Held { .. });
            *state = State::Held { token, valid_until };
            newly
        };
        if newly {
            tracing::info!(lease = %self.inner.name, %token, "Acquired lease");
            let _ = self
                .inner
                .shared
                .event_tx
                .send(LeaseEvent::Acquired(self.inner.name.clone()));
            for listener in self.listeners() {
                listener.after_acquire(self);
            }
        }
    }

    fn lose(&self, next: State) {
        self.notify_before_release();
        self.set_state(next);
        let _ = self
            .inner
            .shared
            .event_tx
            .send(LeaseEvent::Lost(self.inner.name.clone()));
    }

    fn set_state(&self, next: State) {
        let mut state = self.inner.state.lock();
        if !matches!(*state, State::Closed) {
            *state = next;
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn LeaseListener>> {
        self.inner.listeners.lock().clone()
    }

    fn notify_before_release(&self) {
        for listener in self.listeners() {
            listener.before_release(self);
        }
    }
}

struct ManagerInner {
    shared: Arc<Shared>,
    leases: DashMap<String, Lease>,
}

/// Owns the renewal loop for every lease it hands out.
pub struct LeaseManager {
    inner: Arc<ManagerInner>,
    cancel_token: CancellationToken,
    renew_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl LeaseManager {
    /// Start a manager and its renewal loop. Must be called inside a Tokio
    /// runtime. Starts out ready.
    pub fn start(
        holder_id: impl Into<String>,
        backend: Arc<dyn LeaseBackend>,
        config: LeaseConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            holder_id: holder_id.into(),
            backend,
            config,
            ready: AtomicBool::new(true),
            not_ready_since: Mutex::new(None),
            closed: AtomicBool::new(false),
            event_tx,
        });
        let inner = Arc::new(ManagerInner {
            shared,
            leases: DashMap::new(),
        });
        let cancel_token = CancellationToken::new();
        let handle = Self::spawn_renewal_task(inner.clone(), cancel_token.clone());

        Self {
            inner,
            cancel_token,
            renew_handle: Mutex::new(Some(handle)),
        }
    }

    /// Start a manager against the backend selected by `config.lease_backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis backend cannot connect.
    pub async fn from_config(holder_id: impl Into<String>, config: &ClusterConfig) -> Result<Self> {
        let backend: Arc<dyn LeaseBackend> = match config.lease_backend {
            LeaseBackendKind::Redis => {
                Arc::new(RedisLeaseBackend::connect(&config.redis_url, &config.key_prefix).await?)
            }
            LeaseBackendKind::InMemory => Arc::new(InMemoryLeaseBackend::new()),
        };
        tracing::info!(backend = %config.lease_backend, "Lease manager starting");
        Ok(Self::start(holder_id, backend, config.lease.clone()))
    }

    pub fn holder_id(&self) -> &str {
        &self.inner.shared.holder_id
    }

    /// Handle for `name`. Never fails; repeated calls return the same handle.
    pub fn request_lease(&self, name: &str) -> Lease {
        self.inner
            .leases
            .entry(name.to_string())
            .or_insert_with(|| Lease::new(name, self.inner.shared.clone()))
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.inner.shared.event_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.shared.ready.load(Ordering::Acquire)
    }

    /// Readiness gate. Going not-ready stops new acquisitions; held leases
    /// keep renewing until `not_ready_grace` elapses, then are released.
    /// Becoming ready again within the grace keeps them.
    pub fn set_ready(&self, ready: bool) {
        let shared = &self.inner.shared;
        let was_ready = shared.ready.swap(ready, Ordering::AcqRel);
        let mut since = shared.not_ready_since.lock();
        match (was_ready, ready) {
            (true, false) => {
                *since = Some(Instant::now());
                tracing::info!(
                    grace_ms = shared.config.not_ready_grace.as_millis() as u64,
                    "Not ready, holding leases for grace period"
                );
            }
            (false, true) => {
                *since = None;
                tracing::info!("Ready again");
            }
            _ => {}
        }
    }

    pub fn held_leases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .leases
            .iter()
            .filter(|entry| entry.value().is_held())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Release every lease and close the manager. Idempotent; afterwards
    /// every lease, including ones requested later, stays `Closed`.
    pub async fn release_all(&self) {
        if self.inner.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_token.cancel();
        let handle = self.renew_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let leases: Vec<Lease> = self.inner.leases.iter().map(|e| e.value().clone()).collect();
        for lease in &leases {
            lease.close().await;
        }
        tracing::info!(count = leases.len(), "Released all leases");
    }

    fn spawn_renewal_task(
        inner: Arc<ManagerInner>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut renew_interval = tokio::time::interval(inner.shared.config.renew_interval);
            renew_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Lease renewal task shutting down");
                        break;
                    }

                    _ = renew_interval.tick() => {
                        let leases: Vec<Lease> =
                            inner.leases.iter().map(|e| e.value().clone()).collect();

                        let grace_elapsed = inner
                            .shared
                            .not_ready_since
                            .lock()
                            .is_some_and(|since| since.elapsed() >= inner.shared.config.not_ready_grace);

                        if grace_elapsed {
                            let mut released = 0;
                            for lease in leases.iter().filter(|l| l.is_held()) {
                                lease.release().await;
                                released += 1;
                            }
                            if released > 0 {
                                tracing::info!(released, "Readiness grace elapsed, released leases");
                            }
                        } else {
                            for lease in &leases {
                                lease.renew().await;
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_config() -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_millis(300),
            renew_interval: Duration::from_millis(80),
            safety_margin: Duration::from_millis(100),
            not_ready_grace: Duration::from_millis(400),
        }
    }

    fn manager(id: &str, backend: &Arc<InMemoryLeaseBackend>) -> LeaseManager {
        LeaseManager::start(id, backend.clone(), test_config())
    }

    #[derive(Default)]
    struct CountingListener {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl LeaseListener for CountingListener {
        fn after_acquire(&self, _lease: &Lease) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }

        fn before_release(&self, _lease: &Lease) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_request_lease_is_idempotent() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let manager = manager("a", &backend);

        let first = manager.request_lease("orders");
        let second = manager.request_lease("orders");
        assert!(Lease::ptr_eq(&first, &second));
        assert!(!Lease::ptr_eq(&first, &manager.request_lease("payments")));
        assert_eq!(first.status(), LeaseStatus::NotHeld);
    }

    #[tokio::test]
    async fn test_only_one_manager_holds_a_lease() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let a = manager("a", &backend);
        let b = manager("b", &backend);

        assert!(a.request_lease("orders").acquire().await);
        assert!(!b.request_lease("orders").acquire().await);
        assert!(!b.request_lease("orders").check_held().await);

        assert!(a.request_lease("orders").release().await);
        assert!(b.request_lease("orders").acquire().await);
        assert!(!a.request_lease("orders").is_held());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let manager = manager("a", &backend);
        let lease = manager.request_lease("orders");

        assert!(lease.release().await);
        assert!(lease.acquire().await);
        assert!(lease.release().await);
        assert!(lease.release().await);
        assert_eq!(lease.status(), LeaseStatus::NotHeld);
    }

    #[tokio::test]
    async fn test_fencing_token_increases_across_holders() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let a = manager("a", &backend);
        let b = manager("b", &backend);

        let lease_a = a.request_lease("orders");
        lease_a.acquire().await;
        let first = lease_a.fencing_token().unwrap();
        lease_a.release().await;

        let lease_b = b.request_lease("orders");
        lease_b.acquire().await;
        assert!(lease_b.fencing_token().unwrap() > first);
    }

    #[tokio::test]
    async fn test_renewal_keeps_lease_past_ttl() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let manager = manager("a", &backend);
        let lease = manager.request_lease("orders");
        assert!(lease.acquire().await);

        tokio::time::sleep(Duration::from_millis(900)).await;

        assert!(lease.is_held());
        assert_eq!(backend.holder("orders").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_lost_connectivity_drops_lease_before_backend_expiry() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let a = manager("a", &backend);
        let b = manager("b", &backend);
        let mut events = a.subscribe();

        let lease_a = a.request_lease("orders");
        assert!(lease_a.acquire().await);
        backend.set_reachable("a", false);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let held_by_a = lease_a.is_held();
            let held_by_b = b.request_lease("orders").acquire().await;
            assert!(!(held_by_a && held_by_b), "dual ownership");
            if held_by_b {
                break;
            }
            assert!(Instant::now() < deadline, "b never acquired the lease");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(lease_a.status(), LeaseStatus::Unknown);
        let lost = loop {
            match events.recv().await.unwrap() {
                LeaseEvent::Lost(name) => break name,
                _ => continue,
            }
        };
        assert_eq!(lost, "orders");
    }

    #[tokio::test]
    async fn test_check_held_reclaims_after_blip() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let manager = manager("a", &backend);
        let lease = manager.request_lease("orders");
        assert!(lease.acquire().await);

        backend.set_reachable("a", false);
        tokio::time::sleep(Duration::from_millis(210)).await;
        assert!(!lease.is_held());

        backend.set_reachable("a", true);
        assert!(lease.check_held().await);
        assert!(lease.is_held());
    }

    #[tokio::test]
    async fn test_listeners_notified_including_late_registration() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let manager = manager("a", &backend);
        let lease = manager.request_lease("orders");

        let early = Arc::new(CountingListener::default());
        lease.add_listener(early.clone());
        assert!(lease.acquire().await);
        assert_eq!(early.acquired.load(Ordering::SeqCst), 1);

        let late = Arc::new(CountingListener::default());
        lease.add_listener(late.clone());
        assert_eq!(late.acquired.load(Ordering::SeqCst), 1);

        lease.release().await;
        assert_eq!(early.released.load(Ordering::SeqCst), 1);
        assert_eq!(late.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_ready_skips_acquisition() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let manager = manager("a", &backend);
        manager.set_ready(false);

        assert!(!manager.request_lease("orders").acquire().await);
        assert!(backend.holder("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_not_ready_holds_leases_during_grace() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let manager = manager("a", &backend);
        let lease = manager.request_lease("orders");
        assert!(lease.acquire().await);

        manager.set_ready(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(lease.is_held(), "released before grace elapsed");

        manager.set_ready(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(lease.is_held(), "readiness restored within grace");
    }

    #[tokio::test]
    async fn test_not_ready_releases_after_grace() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let manager = manager("a", &backend);
        let lease = manager.request_lease("orders");
        assert!(lease.acquire().await);

        manager.set_ready(false);
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert!(!lease.is_held());
        assert!(backend.holder("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_all_closes_forever() {
        let backend = Arc::new(InMemoryLeaseBackend::new());
        let manager = manager("a", &backend);
        let lease = manager.request_lease("orders");
        assert!(lease.acquire().await);

        manager.release_all().await;
        manager.release_all().await;

        assert_eq!(lease.status(), LeaseStatus::Closed);
        assert!(!lease.acquire().await);
        assert!(!lease.check_held().await);
        assert_eq!(manager.request_lease("payments").status(), LeaseStatus::Closed);
        assert!(backend.holder("orders").await.unwrap().is_none());
    }
}
