// This file is part of qnet-arbiter.

//! Cluster registry (component C6): groups client sessions by cluster name and enforces
//! unique node ids within a group.

use std::collections::HashMap;

pub type SessionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddError {
    DuplicateNodeId,
}

#[derive(Default)]
struct Group {
    members: Vec<(u32, SessionId)>,
}

/// Maps `cluster_name -> group of (node_id, session)`. The instance owns one of these; a
/// session's membership in it is a back-reference, never ownership.
#[derive(Default)]
pub struct ClusterRegistry {
    groups: HashMap<String, Group>,
}

impl ClusterRegistry {
    pub fn new() -> ClusterRegistry {
        ClusterRegistry::default()
    }

    pub fn add(&mut self, cluster_name: &str, node_id: u32, session: SessionId) -> Result<(), AddError> {
        let group = self.groups.entry(cluster_name.to_string()).or_default();
        if group.members.iter().any(|(id, _)| *id == node_id) {
            return Err(AddError::DuplicateNodeId);
        }
        group.members.push((node_id, session));
        Ok(())
    }

    pub fn remove(&mut self, cluster_name: &str, session: SessionId) {
        let empty = if let Some(group) = self.groups.get_mut(cluster_name) {
            group.members.retain(|(_, s)| *s != session);
            group.members.is_empty()
        } else {
            false
        };
        if empty {
            self.groups.remove(cluster_name);
        }
    }

    pub fn iter(&self, cluster_name: &str) -> impl Iterator<Item = (u32, SessionId)> + '_ {
        self.groups
            .get(cluster_name)
            .into_iter()
            .flat_map(|group| group.members.iter().copied())
    }

    pub fn cluster_count(&self) -> usize {
        self.groups.len()
    }

    pub fn member_count(&self, cluster_name: &str) -> usize {
        self.groups.get(cluster_name).map_or(0, |g| g.members.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_node_id_is_rejected() {
        let mut registry = ClusterRegistry::new();
        registry.add("c1", 1, 10).unwrap();
        assert_eq!(registry.add("c1", 1, 20), Err(AddError::DuplicateNodeId));
    }

    #[test]
    fn group_is_deleted_when_last_session_leaves() {
        let mut registry = ClusterRegistry::new();
        registry.add("c1", 1, 10).unwrap();
        registry.remove("c1", 10);
        assert_eq!(registry.cluster_count(), 0);
    }

    #[test]
    fn iter_yields_all_members_of_named_cluster() {
        let mut registry = ClusterRegistry::new();
        registry.add("c1", 1, 10).unwrap();
        registry.add("c1", 2, 20).unwrap();
        registry.add("c2", 1, 30).unwrap();

        let mut members: Vec<_> = registry.iter("c1").collect();
        members.sort();
        assert_eq!(members, vec![(1, 10), (2, 20)]);
    }
}
