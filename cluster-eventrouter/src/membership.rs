use crate::{Member, MembershipSnapshot, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Membership change event.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(Member),
    Left(Member),
}

/// Orchestrator-style view of a candidate member.
///
/// A candidate only becomes a member once it is ready and has been
/// assigned an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub id: String,
    pub address: Option<String>,
    pub ready: bool,
}

impl MemberStatus {
    pub fn ready(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: Some(address.into()),
            ready: true,
        }
    }

    fn as_member(&self) -> Option<Member> {
        match (&self.address, self.ready) {
            (Some(address), true) => Some(Member::new(self.id.clone(), address.clone())),
            _ => None,
        }
    }
}

/// Source of membership for [`MembershipView::spawn_sync`].
#[async_trait]
pub trait MembershipFeed: Send + Sync {
    /// Current set of live members.
    async fn fetch(&self) -> Result<Vec<Member>>;

    /// Announce that the local member is still alive.
    async fn heartbeat(&self) -> Result<()> {
        Ok(())
    }

    /// Drop members whose liveness has lapsed. Returns how many were removed.
    async fn cleanup_stale(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Fixed member list. Useful for single-node deployments and tests.
pub struct StaticMembershipFeed {
    members: Vec<Member>,
}

impl StaticMembershipFeed {
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl MembershipFeed for StaticMembershipFeed {
    async fn fetch(&self) -> Result<Vec<Member>> {
        Ok(self.members.clone())
    }
}

/// Continuously updated, atomically swapped membership snapshot.
///
/// Reads are lock-free. Every change produces a new snapshot with a
/// higher generation; [`MembershipEvent`]s are broadcast after the swap so
/// subscribers always observe the new snapshot.
pub struct MembershipView {
    snapshot: ArcSwap<MembershipSnapshot>,
    candidates: Mutex<BTreeMap<String, MemberStatus>>,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl Default for MembershipView {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipView {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            snapshot: ArcSwap::from_pointee(MembershipSnapshot::empty()),
            candidates: Mutex::new(BTreeMap::new()),
            event_tx,
        }
    }

    pub fn with_members(members: Vec<Member>) -> Self {
        let view = Self::new();
        view.replace(members);
        view
    }

    /// Current snapshot. Lock-free.
    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.snapshot.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.load().generation()
    }

    /// Subscribe to membership change events.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Replace the whole member set. Returns `true` if membership changed.
    pub fn replace(&self, members: Vec<Member>) -> bool {
        let mut candidates = self.candidates.lock();
        *candidates = members
            .iter()
            .map(|m| (m.id.clone(), MemberStatus::ready(m.id.clone(), m.address.clone())))
            .collect();
        self.publish_locked(members)
    }

    /// Record the latest orchestrator status of one candidate.
    pub fn observe(&self, status: MemberStatus) -> bool {
        let mut candidates = self.candidates.lock();
        candidates.insert(status.id.clone(), status);
        let members = candidates.values().filter_map(MemberStatus::as_member).collect();
        self.publish_locked(members)
    }

    /// Forget a candidate entirely (e.g. its pod was deleted).
    pub fn forget(&self, id: &str) -> bool {
        let mut candidates = self.candidates.lock();
        if candidates.remove(id).is_none() {
            return false;
        }
        let members = candidates.values().filter_map(MemberStatus::as_member).collect();
        self.publish_locked(members)
    }

    // Caller holds the candidates lock, which serializes writers.
    fn publish_locked(&self, members: Vec<Member>) -> bool {
        let current = self.snapshot.load_full();
        let next = MembershipSnapshot::new(current.generation() + 1, members);
        if current.same_members(next.members()) {
            return false;
        }

        let before: HashMap<&str, &Member> =
            current.members().iter().map(|m| (m.id.as_str(), m)).collect();
        let after: HashMap<&str, &Member> =
            next.members().iter().map(|m| (m.id.as_str(), m)).collect();

        let mut events = Vec::new();
        for (id, member) in &before {
            if after.get(id) != Some(member) {
                events.push(MembershipEvent::Left((*member).clone()));
            }
        }
        for (id, member) in &after {
            if before.get(id) != Some(member) {
                events.push(MembershipEvent::Joined((*member).clone()));
            }
        }

        tracing::debug!(
            generation = next.generation(),
            count = next.len(),
            "Membership changed"
        );
        self.snapshot.store(Arc::new(next));

        for event in events {
            let _ = self.event_tx.send(event);
        }
        true
    }

    /// Keep this view in sync with `feed` until `cancel_token` fires.
    ///
    /// Each tick sends a heartbeat, occasionally cleans up stale members,
    /// then replaces the snapshot with the feed's current member list.
    /// Failures back off exponentially.
    pub fn spawn_sync(
        self: &Arc<Self>,
        feed: Arc<dyn MembershipFeed>,
        poll_interval: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let view = self.clone();
        tokio::spawn(async move {
            let mut poll_timer = tokio::time::interval(poll_interval);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Membership sync shutting down");
                        break;
                    }

                    _ = poll_timer.tick() => {
                        let outcome: Result<Vec<Member>> = async {
                            feed.heartbeat().await?;
                            // Probabilistic cleanup keeps backend load flat as the cluster grows
                            if rand::random::<u32>() % 100 < 10 {
                                if let Err(e) = feed.cleanup_stale().await {
                                    tracing::warn!("Cleanup failed: {}", e);
                                }
                            }
                            feed.fetch().await
                        }
                        .await;

                        match outcome {
                            Ok(members) => {
                                consecutive_failures = 0;
                                if !view.replace(members) {
                                    tracing::trace!(
                                        count = view.snapshot().len(),
                                        "Poll: no membership changes"
                                    );
                                }
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(6));
                                tracing::error!(
                                    failures = consecutive_failures,
                                    backoff_ms,
                                    "Membership sync failed: {}, backing off",
                                    e
                                );
                                tokio::select! {
                                    _ = cancel_token.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                                }
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
    use crate::Error;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn member(id: &str) -> Member {
        Member::new(id, format!("{}.svc:7000", id))
    }

    #[test]
    fn test_replace_bumps_generation_only_on_change() {
        let view = MembershipView::new();
        assert_eq!(view.generation(), 0);

        assert!(view.replace(vec![member("a"), member("b")]));
        assert_eq!(view.generation(), 1);

        assert!(!view.replace(vec![member("b"), member("a")]));
        assert_eq!(view.generation(), 1);

        assert!(view.replace(vec![member("a")]));
        assert_eq!(view.generation(), 2);
    }

    #[test]
    fn test_old_snapshot_is_unaffected_by_replace() {
        let view = MembershipView::with_members(vec![member("a"), member("b")]);
        let before = view.snapshot();
        view.replace(vec![member("c")]);

        assert_eq!(before.len(), 2);
        assert!(before.contains("a"));
        assert!(view.snapshot().contains("c"));
    }

    #[tokio::test]
    async fn test_events_broadcast_after_swap() {
        let view = MembershipView::with_members(vec![member("a")]);
        let mut rx = view.subscribe();

        view.replace(vec![member("b")]);

        let mut events = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        events.sort_by_key(|e| matches!(e, MembershipEvent::Joined(_)));
        assert_eq!(events[0], MembershipEvent::Left(member("a")));
        assert_eq!(events[1], MembershipEvent::Joined(member("b")));
        assert!(view.snapshot().contains("b"));
    }

    #[test]
    fn test_member_not_added_if_not_ready() {
        let view = MembershipView::new();
        view.observe(MemberStatus {
            id: "a".into(),
            address: Some("10.0.0.1:7000".into()),
            ready: false,
        });
        assert!(view.snapshot().is_empty());
    }

    #[test]
    fn test_member_not_added_without_address() {
        let view = MembershipView::new();
        view.observe(MemberStatus {
            id: "a".into(),
            address: None,
            ready: true,
        });
        assert!(view.snapshot().is_empty());
    }

    #[test]
    fn test_member_removed_when_it_becomes_not_ready() {
        let view = MembershipView::new();
        view.observe(MemberStatus::ready("a", "10.0.0.1:7000"));
        view.observe(MemberStatus::ready("b", "10.0.0.2:7000"));
        assert_eq!(view.snapshot().len(), 2);

        view.observe(MemberStatus {
            id: "b".into(),
            address: Some("10.0.0.2:7000".into()),
            ready: false,
        });
        assert_eq!(view.snapshot().len(), 1);
        assert!(!view.snapshot().contains("b"));
    }

    #[test]
    fn test_forget_removes_member() {
        let view = MembershipView::new();
        view.observe(MemberStatus::ready("a", "10.0.0.1:7000"));
        assert!(view.forget("a"));
        assert!(!view.forget("a"));
        assert!(view.snapshot().is_empty());
    }

    struct FlakyFeed {
        fail: AtomicBool,
        members: Vec<Member>,
    }

    #[async_trait]
    impl MembershipFeed for FlakyFeed {
        async fn fetch(&self) -> Result<Vec<Member>> {
            if self.fail.swap(false, Ordering::AcqRel) {
                return Err(Error::connection("registry unreachable"));
            }
            Ok(self.members.clone())
        }
    }

    #[tokio::test]
    async fn test_sync_recovers_after_feed_failure() {
        let view = Arc::new(MembershipView::new());
        let feed = Arc::new(FlakyFeed {
            fail: AtomicBool::new(true),
            members: vec![member("a"), member("b")],
        });
        let cancel = CancellationToken::new();
        let handle = view.spawn_sync(feed, Duration::from_millis(20), cancel.clone());

        for _ in 0..50 {
            if view.snapshot().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(view.snapshot().len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
