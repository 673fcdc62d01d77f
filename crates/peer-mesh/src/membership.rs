use std::collections::HashSet;

use crate::PeerId;

/// Peers currently present in the room, in first-seen order.
#[derive(Debug, Default)]
pub struct MembershipTracker {
    order: Vec<PeerId>,
    present: HashSet<PeerId>,
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the peer was already present.
    pub fn add(&mut self, peer_id: &str) -> bool {
        if !self.present.insert(peer_id.to_string()) {
            return false;
        }
        self.order.push(peer_id.to_string());
        true
    }

    /// Returns `false` if the peer was not present.
    pub fn remove(&mut self, peer_id: &str) -> bool {
        if !self.present.remove(peer_id) {
            return false;
        }
        self.order.retain(|id| id != peer_id);
        true
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.present.contains(peer_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeerId> {
        self.order.clone()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.present.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_are_idempotent() {
        let mut members = MembershipTracker::new();
        assert!(members.add("p1"));
        assert!(members.add("p2"));
        assert!(!members.add("p1"));
        assert_eq!(members.snapshot(), vec!["p1", "p2"]);

        assert!(members.remove("p1"));
        assert!(!members.remove("p1"));
        assert_eq!(members.snapshot(), vec!["p2"]);
    }

    #[test]
    fn rejoin_moves_peer_to_the_end() {
        let mut members = MembershipTracker::new();
        members.add("p1");
        members.add("p2");
        members.remove("p1");
        members.add("p1");
        assert_eq!(members.snapshot(), vec!["p2", "p1"]);
        assert!(members.contains("p1"));
        assert_eq!(members.len(), 2);
    }
}
