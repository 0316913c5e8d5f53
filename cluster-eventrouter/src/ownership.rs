use crate::config::ClusterConfig;
use crate::lease::{Lease, LeaseEvent, LeaseManager};
use crate::weight::ClusterWeight;
use crate::{Error, Member, MembershipEvent, Partitioner};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnershipState {
    Unowned,
    Acquiring,
    Owned,
    Releasing,
}

impl OwnershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unowned => "unowned",
            Self::Acquiring => "acquiring",
            Self::Owned => "owned",
            Self::Releasing => "releasing",
        }
    }
}

impl fmt::Display for OwnershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable view of one resource's ownership. Replaced wholesale on every
/// change.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipRecord {
    pub resource: String,
    pub state: OwnershipState,
    /// Member the partitioner designated at the last evaluation.
    pub designated: Option<Member>,
    /// Membership generation of that evaluation.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipChange {
    pub resource: String,
    pub from: OwnershipState,
    pub to: OwnershipState,
    pub designated: Option<Member>,
}

struct Slot {
    record: ArcSwap<OwnershipRecord>,
    lease: Lease,
}

enum Command {
    Register(String),
    Evaluate(String),
    EvaluateAll,
    Unregister(String, oneshot::Sender<()>),
    AcquireFinished {
        resource: String,
        attempt: u64,
        acquired: bool,
    },
    ReleaseFinished {
        resource: String,
        attempt: u64,
    },
}

struct CoordinatorInner {
    local: Member,
    partitioner: Arc<Partitioner>,
    leases: Arc<LeaseManager>,
    weight: Arc<dyn ClusterWeight>,
    config: ClusterConfig,
    slots: DashMap<String, Arc<Slot>>,
    change_tx: broadcast::Sender<OwnershipChange>,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorInner {
    fn ensure_slot(&self, resource: &str) -> Arc<Slot> {
        self.slots
            .entry(resource.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    record: ArcSwap::from_pointee(OwnershipRecord {
                        resource: resource.to_string(),
                        state: OwnershipState::Unowned,
                        designated: None,
                        generation: 0,
                    }),
                    lease: self.leases.request_lease(resource),
                })
            })
            .clone()
    }

    fn send(&self, command: Command) {
        // Receiver lives as long as the worker task
        let _ = self.command_tx.send(command);
    }

    fn transition(
        &self,
        slot: &Slot,
        state: OwnershipState,
        designated: Option<Member>,
        generation: u64,
    ) {
        let current = slot.record.load_full();
        let next = OwnershipRecord {
            resource: current.resource.clone(),
            state,
            designated,
            generation,
        };
        if current.state == next.state && current.designated == next.designated {
            if current.generation != next.generation {
                slot.record.store(Arc::new(next));
            }
            return;
        }

        if current.state != state {
            tracing::debug!(
                resource = %next.resource,
                from = %current.state,
                to = %state,
                "Ownership state changed"
            );
        }
        let change = OwnershipChange {
            resource: next.resource.clone(),
            from: current.state,
            to: state,
            designated: next.designated.clone(),
        };
        slot.record.store(Arc::new(next));
        let _ = self.change_tx.send(change);
    }
}

/// Per-resource bookkeeping only the worker task touches.
#[derive(Default)]
struct Progress {
    attempt: u64,
    failures: u32,
    retry_at: Option<Instant>,
    removing: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

/// Reconciles partitioner designation with lease reality for every
/// registered resource.
///
/// All record mutations happen on one worker task, fed by commands,
/// membership events, lease events and a periodic tick. Readers load
/// records lock-free.
pub struct OwnershipCoordinator {
    inner: Arc<CoordinatorInner>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for OwnershipCoordinator {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl OwnershipCoordinator {
    /// Start the coordinator's worker task. Must be called inside a Tokio
    /// runtime.
    pub fn start(
        local: Member,
        partitioner: Arc<Partitioner>,
        leases: Arc<LeaseManager>,
        weight: Arc<dyn ClusterWeight>,
        config: &ClusterConfig,
    ) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let membership_rx = partitioner.view().subscribe();
        let lease_rx = leases.subscribe();

        let inner = Arc::new(CoordinatorInner {
            local,
            partitioner,
            leases,
            weight,
            config: config.clone(),
            slots: DashMap::new(),
            change_tx,
            command_tx,
        });
        let cancel_token = CancellationToken::new();

        let worker = Worker {
            inner: inner.clone(),
            progress: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run(
            command_rx,
            membership_rx,
            lease_rx,
            cancel_token.clone(),
        ));

        tracing::info!(member = %inner.local, "Ownership coordinator started");
        Self {
            inner,
            cancel_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn local(&self) -> &Member {
        &self.inner.local
    }

    pub fn partitioner(&self) -> &Arc<Partitioner> {
        &self.inner.partitioner
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.inner.leases
    }

    /// Start tracking `resource`. Idempotent.
    pub fn register(&self, resource: &str) -> Arc<OwnershipRecord> {
        let slot = self.inner.ensure_slot(resource);
        self.inner.send(Command::Register(resource.to_string()));
        slot.record.load_full()
    }

    /// Stop tracking `resource`, releasing its lease first if held.
    /// Completes once the record is gone.
    pub async fn unregister(&self, resource: &str) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .send(Command::Unregister(resource.to_string(), reply_tx));
        let _ = reply_rx.await;
    }

    pub fn record(&self, resource: &str) -> Option<Arc<OwnershipRecord>> {
        self.inner
            .slots
            .get(resource)
            .map(|slot| slot.record.load_full())
    }

    pub fn records(&self) -> Vec<Arc<OwnershipRecord>> {
        let mut records: Vec<_> = self
            .inner
            .slots
            .iter()
            .map(|slot| slot.record.load_full())
            .collect();
        records.sort_by(|a, b| a.resource.cmp(&b.resource));
        records
    }

    pub fn lease(&self, resource: &str) -> Option<Lease> {
        self.inner.slots.get(resource).map(|slot| slot.lease.clone())
    }

    /// `true` only while the record is `Owned` and the lease is locally
    /// valid.
    pub fn is_owned(&self, resource: &str) -> bool {
        self.inner.slots.get(resource).is_some_and(|slot| {
            slot.record.load().state == OwnershipState::Owned && slot.lease.is_held()
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OwnershipChange> {
        self.inner.change_tx.subscribe()
    }

    /// Forward readiness to the lease manager and re-evaluate.
    pub fn set_ready(&self, ready: bool) {
        self.inner.leases.set_ready(ready);
        self.reevaluate_now();
    }

    pub fn reevaluate_now(&self) {
        self.inner.send(Command::EvaluateAll);
    }

    /// Wait until `resource` reaches `state`. Returns `false` on timeout.
    pub async fn wait_for_state(
        &self,
        resource: &str,
        state: OwnershipState,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut changes = self.subscribe();
        loop {
            if self.record(resource).is_some_and(|r| r.state == state) {
                return true;
            }
            tokio::select! {
                _ = changes.recv() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.record(resource).is_some_and(|r| r.state == state);
                }
            }
        }
    }

    /// Stop the worker and release every lease. Records end `Unowned`.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.leases.release_all().await;

        // Worker is gone; this is now the only writer
        let slots: Vec<Arc<Slot>> = self.inner.slots.iter().map(|s| s.value().clone()).collect();
        for slot in slots {
            let record = slot.record.load_full();
            self.inner.transition(
                &slot,
                OwnershipState::Unowned,
                record.designated.clone(),
                record.generation,
            );
        }
        tracing::info!(member = %self.inner.local, "Ownership coordinator stopped");
    }
}

struct Worker {
    inner: Arc<CoordinatorInner>,
    progress: HashMap<String, Progress>,
}

impl Worker {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut membership_rx: broadcast::Receiver<MembershipEvent>,
        mut lease_rx: broadcast::Receiver<LeaseEvent>,
        cancel_token: CancellationToken,
    ) {
        let mut reevaluate_interval = tokio::time::interval(self.inner.config.reevaluate_interval);
        reevaluate_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    tracing::debug!("Ownership worker shutting down");
                    break;
                }

                Some(command) = command_rx.recv() => self.handle(command),

                event = membership_rx.recv() => match event {
                    Ok(event) => {
                        tracing::debug!(?event, "Membership changed, re-evaluating ownership");
                        self.evaluate_all();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Membership events lagged");
                        self.evaluate_all();
                    }
                    Err(RecvError::Closed) => break,
                },

                event = lease_rx.recv() => match event {
                    Ok(LeaseEvent::Lost(name)) | Ok(LeaseEvent::Released(name)) => self.evaluate(&name),
                    Ok(LeaseEvent::Acquired(_)) => {}
                    Err(RecvError::Lagged(_)) => self.evaluate_all(),
                    Err(RecvError::Closed) => break,
                },

                _ = reevaluate_interval.tick() => self.evaluate_all(),
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(resource) => {
                // A re-registration cancels a pending removal
                self.inner.ensure_slot(&resource);
                if let Some(progress) = self.progress.get_mut(&resource) {
                    if progress.removing {
                        progress.removing = false;
                        for waiter in progress.waiters.drain(..) {
                            let _ = waiter.send(());
                        }
                    }
                }
                self.evaluate(&resource);
            }
            Command::Evaluate(resource) => self.evaluate(&resource),
            Command::EvaluateAll => self.evaluate_all(),
            Command::Unregister(resource, reply) => self.unregister(resource, reply),
            Command::AcquireFinished {
                resource,
                attempt,
                acquired,
            } => self.acquire_finished(&resource, attempt, acquired),
            Command::ReleaseFinished { resource, attempt } => {
                self.release_finished(&resource, attempt)
            }
        }
    }

    fn slot(&self, resource: &str) -> Option<Arc<Slot>> {
        self.inner.slots.get(resource).map(|s| s.value().clone())
    }

    fn evaluate_all(&mut self) {
        let resources: Vec<String> = self.inner.slots.iter().map(|s| s.key().clone()).collect();
        for resource in resources {
            self.evaluate(&resource);
        }
    }

    /// Designated member for `resource` and whether that is an admitted
    /// local member.
    fn designation(&self, resource: &str) -> (Option<Member>, u64, bool) {
        let snapshot = self.inner.partitioner.view().snapshot();
        let designated = self.inner.partitioner.get_in(&snapshot, resource).ok();
        let eligible = designated
            .as_ref()
            .is_some_and(|m| m.id == self.inner.local.id)
            && self.inner.weight.weight() > 0;
        (designated, snapshot.generation(), eligible)
    }

    fn evaluate(&mut self, resource: &str) {
        let Some(slot) = self.slot(resource) else {
            return;
        };
        let (removing, backing_off) = match self.progress.get(resource) {
            Some(p) => (p.removing, p.retry_at.is_some_and(|at| Instant::now() < at)),
            None => (false, false),
        };
        if removing {
            return;
        }

        let (designated, generation, eligible) = self.designation(resource);
        let state = slot.record.load().state;

        match state {
            OwnershipState::Unowned => {
                if eligible && self.inner.leases.is_ready() && !backing_off {
                    self.start_acquire(resource, &slot, designated, generation);
                } else {
                    self.inner.transition(&slot, state, designated, generation);
                }
            }
            OwnershipState::Acquiring => {
                if eligible {
                    self.inner.transition(&slot, state, designated, generation);
                } else {
                    tracing::debug!(resource, "No longer designated while acquiring");
                    self.start_release(resource, &slot, designated, generation);
                }
            }
            OwnershipState::Owned => {
                if !slot.lease.is_held() {
                    tracing::warn!(resource, "{}", Error::OwnershipLost(resource.to_string()));
                    self.start_release(resource, &slot, designated, generation);
                } else if !eligible {
                    tracing::info!(
                        resource,
                        designated = ?designated.as_ref().map(|m| m.id.as_str()),
                        "Designation moved, releasing ownership"
                    );
                    self.start_release(resource, &slot, designated, generation);
                } else {
                    self.inner.transition(&slot, state, designated, generation);
                }
            }
            OwnershipState::Releasing => {
                self.inner.transition(&slot, state, designated, generation);
            }
        }
    }

    fn next_attempt(&mut self, resource: &str) -> u64 {
        let progress = self.progress.entry(resource.to_string()).or_default();
        progress.attempt += 1;
        progress.attempt
    }

    fn start_acquire(
        &mut self,
        resource: &str,
        slot: &Arc<Slot>,
        designated: Option<Member>,
        generation: u64,
    ) {
        let attempt = self.next_attempt(resource);
        self.inner
            .transition(slot, OwnershipState::Acquiring, designated, generation);

        let lease = slot.lease.clone();
        let inner = self.inner.clone();
        let resource = resource.to_string();
        tokio::spawn(async move {
            let acquired = lease.acquire().await;
            inner.send(Command::AcquireFinished {
                resource,
                attempt,
                acquired,
            });
        });
    }

    fn start_release(
        &mut self,
        resource: &str,
        slot: &Arc<Slot>,
        designated: Option<Member>,
        generation: u64,
    ) {
        let attempt = self.next_attempt(resource);
        self.inner
            .transition(slot, OwnershipState::Releasing, designated, generation);

        let lease = slot.lease.clone();
        let inner = self.inner.clone();
        let resource = resource.to_string();
        tokio::spawn(async move {
            lease.release().await;
            inner.send(Command::ReleaseFinished { resource, attempt });
        });
    }

    fn is_current(&self, resource: &str, attempt: u64) -> bool {
        self.progress
            .get(resource)
            .is_some_and(|p| p.attempt == attempt)
    }

    fn acquire_finished(&mut self, resource: &str, attempt: u64, acquired: bool) {
        if !self.is_current(resource, attempt) {
            tracing::trace!(resource, attempt, "Ignoring stale acquisition result");
            return;
        }
        let Some(slot) = self.slot(resource) else {
            return;
        };
        if slot.record.load().state != OwnershipState::Acquiring {
            return;
        }

        let (designated, generation, eligible) = self.designation(resource);
        if acquired {
            if let Some(progress) = self.progress.get_mut(resource) {
                progress.failures = 0;
                progress.retry_at = None;
            }
            if eligible {
                tracing::info!(
                    resource,
                    token = ?slot.lease.fencing_token(),
                    "Ownership acquired"
                );
                self.inner
                    .transition(&slot, OwnershipState::Owned, designated, generation);
            } else {
                tracing::debug!(resource, "Designation moved during acquisition");
                self.start_release(resource, &slot, designated, generation);
            }
            return;
        }

        let failures = match self.progress.get_mut(resource) {
            Some(progress) => {
                progress.failures += 1;
                progress.failures
            }
            None => 1,
        };
        let backoff = self.inner.config.acquire_backoff(failures);
        if let Some(progress) = self.progress.get_mut(resource) {
            progress.retry_at = Some(Instant::now() + backoff);
        }
        tracing::debug!(
            resource,
            failures,
            backoff_ms = backoff.as_millis() as u64,
            "{}",
            Error::lease_failed(resource, "held elsewhere or backend unavailable")
        );
        // Clears a grant the backend may have made before the error
        self.start_release(resource, &slot, designated, generation);

        let inner = self.inner.clone();
        let resource = resource.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            inner.send(Command::Evaluate(resource));
        });
    }

    fn release_finished(&mut self, resource: &str, attempt: u64) {
        if !self.is_current(resource, attempt) {
            return;
        }
        let Some(slot) = self.slot(resource) else {
            return;
        };
        let record = slot.record.load_full();
        self.inner.transition(
            &slot,
            OwnershipState::Unowned,
            record.designated.clone(),
            record.generation,
        );

        if self.progress.get(resource).is_some_and(|p| p.removing) {
            self.remove(resource);
        } else {
            self.evaluate(resource);
        }
    }

    fn unregister(&mut self, resource: String, reply: oneshot::Sender<()>) {
        let Some(slot) = self.slot(&resource) else {
            let _ = reply.send(());
            return;
        };
        let progress = self.progress.entry(resource.clone()).or_default();
        progress.removing = true;
        progress.waiters.push(reply);

        let record = slot.record.load_full();
        match record.state {
            OwnershipState::Unowned => self.remove(&resource),
            OwnershipState::Acquiring | OwnershipState::Owned => {
                self.start_release(
                    &resource,
                    &slot,
                    record.designated.clone(),
                    record.generation,
                );
            }
            // Finishing release completes the removal
            OwnershipState::Releasing => {}
        }
    }

    fn remove(&mut self, resource: &str) {
        self.inner.slots.remove(resource);
        if let Some(progress) = self.progress.remove(resource) {
            for waiter in progress.waiters {
                let _ = waiter.send(());
            }
        }
        tracing::debug!(resource, "Resource unregistered");
    }
}
