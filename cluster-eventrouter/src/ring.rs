use crate::{Member, MembershipSnapshot};
use siphasher::sip::SipHasher24;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;

/// Consistent hash ring with virtual nodes.
///
/// Each member is placed on the 64-bit ring at `virtual_nodes` points.
/// A key belongs to the member owning the first point at or clockwise
/// after the key's hash. Built once per membership generation; two
/// processes building a ring from the same member set get identical rings.
#[derive(Clone, Debug)]
pub struct HashRing {
    generation: u64,
    points: BTreeMap<u64, usize>,
    snapshot: Arc<MembershipSnapshot>,
}

impl HashRing {
    pub fn build(snapshot: Arc<MembershipSnapshot>, virtual_nodes: usize) -> Self {
        let mut points = BTreeMap::new();
        // Members are sorted by id, so on a point collision the smaller id wins
        for (idx, member) in snapshot.members().iter().enumerate() {
            for vnode in 0..virtual_nodes {
                let point = Self::hash_key(&format!("{}#{}", member.id, vnode));
                points.entry(point).or_insert(idx);
            }
        }

        Self {
            generation: snapshot.generation(),
            points,
            snapshot,
        }
    }

    /// Membership generation this ring was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> &Arc<MembershipSnapshot> {
        &self.snapshot
    }

    /// Get the number of members in the ring.
    pub fn instance_count(&self) -> usize {
        self.snapshot.len()
    }

    /// Member responsible for `key`, or `None` if the ring is empty.
    pub fn get(&self, key: &str) -> Option<&Member> {
        let hash = Self::hash_key(key);
        let idx = self
            .points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, idx)| *idx)?;
        self.snapshot.members().get(idx)
    }

    /// Check if `member_id` should handle the given key.
    pub fn should_handle(&self, key: &str, member_id: &str) -> bool {
        self.get(key).is_some_and(|m| m.id == member_id)
    }

    #[inline]
    fn hash_key(key: &str) -> u64 {
        // Fixed zero keys: the ring must hash identically in every process
        let mut hasher = SipHasher24::new_with_keys(0, 0);
        hasher.write(key.as_bytes());
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(generation: u64, ids: &[&str]) -> Arc<MembershipSnapshot> {
        Arc::new(MembershipSnapshot::new(
            generation,
            ids.iter().map(|id| Member::new(*id, format!("{}:7000", id))),
        ))
    }

    #[test]
    fn test_hashring_solo_instance_handles_all() {
        let ring = HashRing::build(snapshot(1, &["instance-1"]), 160);
        assert!(ring.should_handle("any-topic", "instance-1"));
        assert!(ring.should_handle("another-topic", "instance-1"));
    }

    #[test]
    fn test_hashring_empty_ring_has_no_owner() {
        let ring = HashRing::build(snapshot(0, &[]), 160);
        assert!(ring.get("any-key").is_none());
        assert_eq!(ring.instance_count(), 0);
    }

    #[test]
    fn test_hashring_exactly_one_owner_per_key() {
        let ring = HashRing::build(snapshot(1, &["instance-1", "instance-2", "instance-3"]), 160);

        for i in 0..1000 {
            let key = format!("topic-{:064x}", i);
            let owners = ["instance-1", "instance-2", "instance-3"]
                .iter()
                .filter(|id| ring.should_handle(&key, id))
                .count();
            assert_eq!(owners, 1, "Key {} should have exactly 1 owner", key);
        }
    }

    #[test]
    fn test_hashring_consistent_assignment() {
        let ring = HashRing::build(snapshot(1, &["instance-1", "instance-2", "instance-3"]), 160);

        let first = ring.get("orders").cloned();
        for _ in 0..10 {
            assert_eq!(ring.get("orders").cloned(), first);
        }
    }

    #[test]
    fn test_hashring_independent_builds_agree() {
        // Same member set observed in a different order and generation
        let ring1 = HashRing::build(snapshot(4, &["a", "b", "c", "d"]), 160);
        let ring2 = HashRing::build(snapshot(9, &["d", "c", "b", "a"]), 160);

        for i in 0..1000 {
            let key = format!("key-{}", i);
            assert_eq!(ring1.get(&key), ring2.get(&key), "Key {} disagrees", key);
        }
    }

    #[test]
    fn test_hashring_three_instances_split_work() {
        let ids = ["instance-1", "instance-2", "instance-3"];
        let ring = HashRing::build(snapshot(1, &ids), 160);

        for id in ids {
            let handled = (0..3000)
                .filter(|i| ring.should_handle(&format!("topic-{}", i), id))
                .count();
            assert!(
                (600..=1400).contains(&handled),
                "{} handles {} of 3000 keys",
                id,
                handled
            );
        }
    }

    #[test]
    fn test_hashring_adding_member_only_moves_keys_to_it() {
        let before = HashRing::build(snapshot(1, &["a", "b", "c"]), 160);
        let after = HashRing::build(snapshot(2, &["a", "b", "c", "d"]), 160);

        for i in 0..2000 {
            let key = format!("key-{}", i);
            let old = before.get(&key).unwrap();
            let new = after.get(&key).unwrap();
            assert!(
                old == new || new.id == "d",
                "Key {} moved from {} to {}",
                key,
                old.id,
                new.id
            );
        }
    }
}
