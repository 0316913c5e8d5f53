use crate::{Error, HashRing, Member, MembershipSnapshot, MembershipView, Result};
use arc_swap::ArcSwapOption;
use std::sync::Arc;

/// Resource-to-member mapping over the current membership view.
///
/// The hash ring is cached per membership generation and rebuilt the first
/// time a lookup observes a newer generation. Lookups are lock-free.
pub struct Partitioner {
    view: Arc<MembershipView>,
    virtual_nodes: usize,
    ring: ArcSwapOption<HashRing>,
}

impl Partitioner {
    pub fn new(view: Arc<MembershipView>, virtual_nodes: usize) -> Self {
        Self {
            view,
            virtual_nodes: virtual_nodes.max(1),
            ring: ArcSwapOption::empty(),
        }
    }

    pub fn view(&self) -> &Arc<MembershipView> {
        &self.view
    }

    /// Member designated to own `resource_id` under the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMembersAvailable`] if the snapshot is empty.
    pub fn get(&self, resource_id: &str) -> Result<Member> {
        let snapshot = self.view.snapshot();
        self.get_in(&snapshot, resource_id)
    }

    /// Same as [`get`](Self::get) against an explicit snapshot.
    pub fn get_in(&self, snapshot: &Arc<MembershipSnapshot>, resource_id: &str) -> Result<Member> {
        if snapshot.is_empty() {
            return Err(Error::NoMembersAvailable);
        }
        self.ring_for(snapshot)
            .get(resource_id)
            .cloned()
            .ok_or(Error::NoMembersAvailable)
    }

    /// The ring for the current snapshot.
    pub fn ring(&self) -> Arc<HashRing> {
        let snapshot = self.view.snapshot();
        self.ring_for(&snapshot)
    }

    fn ring_for(&self, snapshot: &Arc<MembershipSnapshot>) -> Arc<HashRing> {
        if let Some(ring) = self.ring.load_full() {
            if ring.generation() == snapshot.generation() {
                return ring;
            }
        }

        let ring = Arc::new(HashRing::build(snapshot.clone(), self.virtual_nodes));
        // Only replace the cache with a newer generation; lookups against an
        // older explicit snapshot must not evict the current ring
        let current = self.ring.load();
        let newer = current
            .as_ref()
            .map_or(true, |cached| cached.generation() < ring.generation());
        if newer {
            tracing::debug!(
                generation = ring.generation(),
                count = ring.instance_count(),
                "Hash ring rebuilt"
            );
            self.ring.store(Some(ring.clone()));
        }
        ring
    }
}
