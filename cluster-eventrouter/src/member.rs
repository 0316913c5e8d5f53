use serde::{Deserialize, Serialize};
use std::fmt;

/// One addressable process in the cluster.
///
/// Members are immutable; an address change is observed as the old member
/// leaving and a new one joining.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub address: String,
}

impl Member {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Immutable, versioned set of members.
///
/// Members are kept sorted by id so that two processes observing the same
/// set build identical hash rings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    generation: u64,
    members: Vec<Member>,
}

impl MembershipSnapshot {
    pub fn new(generation: u64, members: impl IntoIterator<Item = Member>) -> Self {
        let mut members: Vec<Member> = members.into_iter().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members.dedup_by(|a, b| a.id == b.id);
        Self {
            generation,
            members,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Member> {
        self.members
            .binary_search_by(|m| m.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.members[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// True when both snapshots hold exactly the same members, ignoring
    /// generation.
    pub fn same_members(&self, members: &[Member]) -> bool {
        self.members == members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_sorts_and_dedups() {
        let snapshot = MembershipSnapshot::new(
            1,
            vec![
                Member::new("c", "10.0.0.3:7000"),
                Member::new("a", "10.0.0.1:7000"),
                Member::new("b", "10.0.0.2:7000"),
                Member::new("a", "10.0.0.9:7000"),
            ],
        );
        let ids: Vec<&str> = snapshot.members().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_snapshot_lookup_by_id() {
        let snapshot = MembershipSnapshot::new(
            3,
            vec![Member::new("a", "10.0.0.1:7000"), Member::new("b", "10.0.0.2:7000")],
        );
        assert_eq!(snapshot.get("b").unwrap().address, "10.0.0.2:7000");
        assert!(snapshot.get("z").is_none());
        assert_eq!(snapshot.generation(), 3);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = MembershipSnapshot::empty();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.generation(), 0);
    }
}
