// This file is part of qnet-arbiter.

use super::{Algorithm, ClusterView, NodeListKind, SessionContext, TieBreaker, Vote, FFSPLIT_ID};
use std::collections::HashMap;

/// The partition already granted ACK for one ring, recorded so siblings stay consistent.
struct RingDecision {
    ring_id: u64,
    acked_partition: Vec<u32>,
}

/// Fifty-fifty split: ACKs the partition holding a strict majority of the configured node
/// set, or the side the tie-breaker favors on an even split. Once a partition has been ACKed
/// for a ring, every sibling session is held to that same decision for the rest of that ring's
/// lifetime, so the cluster never sees two different partitions both believing they're quorate.
pub struct FfsplitAlgorithm {
    decisions: HashMap<String, RingDecision>,
}

impl FfsplitAlgorithm {
    pub fn new() -> FfsplitAlgorithm {
        FfsplitAlgorithm {
            decisions: HashMap::new(),
        }
    }

    fn decide(&mut self, cluster_name: &str, tie_breaker: TieBreaker, ring_id: u64, configured: &[u32], partition: &[u32]) -> Vote {
        if let Some(existing) = self.decisions.get(cluster_name) {
            if existing.ring_id == ring_id {
                return if existing.acked_partition == partition {
                    Vote::Ack
                } else {
                    Vote::Nack
                };
            }
        }

        let n = configured.len();
        let m = partition.len();
        let majority = 2 * m > n;
        let tie_wins = 2 * m == n && tie_breaker.favors(configured, partition);

        if majority || tie_wins {
            self.decisions.insert(
                cluster_name.to_string(),
                RingDecision {
                    ring_id,
                    acked_partition: partition.to_vec(),
                },
            );
            Vote::Ack
        } else {
            Vote::Nack
        }
    }
}

impl Algorithm for FfsplitAlgorithm {
    fn id(&self) -> u8 {
        FFSPLIT_ID
    }

    fn name(&self) -> &'static str {
        "FFSPLIT"
    }

    fn disconnect(&mut self, ctx: &SessionContext, _server_going_down: bool) {
        self.decisions.remove(ctx.cluster_name);
    }

    fn on_node_list(
        &mut self,
        ctx: &SessionContext,
        kind: NodeListKind,
        ring_id: u64,
        nodes: &[u32],
        view: &dyn ClusterView,
    ) -> Vote {
        if ctx.heuristics_failed {
            return Vote::Nack;
        }
        if kind == NodeListKind::Config || kind == NodeListKind::Initial {
            return Vote::Ack;
        }
        let configured = view.configured_nodes(ctx.cluster_name);
        self.decide(ctx.cluster_name, ctx.tie_breaker, ring_id, &configured, nodes)
    }

    fn on_ask_for_vote(&mut self, ctx: &SessionContext, ring_id: u64, _view: &dyn ClusterView) -> Vote {
        if ctx.heuristics_failed {
            return Vote::Nack;
        }
        match self.decisions.get(ctx.cluster_name) {
            Some(decision) if decision.ring_id == ring_id => Vote::Ack,
            // No partition has been decided for this ring yet: wait for a NODE_LIST to settle
            // it rather than guess ahead of the cluster's own membership view.
            _ => Vote::WaitForReply,
        }
    }

    /// Resolves a `WaitForReply` left over from `on_ask_for_vote` once the bounded algorithm
    /// timer fires: ACK if some ring has since been decided for this cluster, NACK if the
    /// timeout elapsed with nothing settled.
    fn on_timer(&mut self, ctx: &SessionContext) -> Vote {
        match self.decisions.get(ctx.cluster_name) {
            Some(_) => Vote::Ack,
            None => Vote::Nack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedView {
        configured: Vec<u32>,
    }
    impl ClusterView for FixedView {
        fn configured_nodes(&self, _cluster_name: &str) -> Vec<u32> {
            self.configured.clone()
        }
        fn siblings(&self, _cluster_name: &str, _exclude: usize) -> Vec<(usize, u32, Vec<u32>)> {
            vec![]
        }
    }

    fn ctx(node_id: u32, tie_breaker: TieBreaker) -> SessionContext<'static> {
        SessionContext {
            session: node_id as usize,
            cluster_name: "c",
            node_id,
            heuristics_failed: false,
            tie_breaker,
        }
    }

    #[test]
    fn strict_majority_acks() {
        let mut algo = FfsplitAlgorithm::new();
        let view = FixedView { configured: vec![1, 2, 3] };
        let vote = algo.on_node_list(&ctx(1, TieBreaker::Lowest), NodeListKind::Membership, 7, &[1, 2], &view);
        assert_eq!(vote, Vote::Ack);
    }

    #[test]
    fn minority_nacks() {
        let mut algo = FfsplitAlgorithm::new();
        let view = FixedView { configured: vec![1, 2, 3] };
        let vote = algo.on_node_list(&ctx(3, TieBreaker::Lowest), NodeListKind::Membership, 7, &[3], &view);
        assert_eq!(vote, Vote::Nack);
    }

    #[test]
    fn even_split_tie_breaker_decides() {
        let mut algo = FfsplitAlgorithm::new();
        let view = FixedView { configured: vec![1, 2] };
        let vote = algo.on_node_list(&ctx(1, TieBreaker::Lowest), NodeListKind::Membership, 1, &[1], &view);
        assert_eq!(vote, Vote::Ack);

        let mut algo2 = FfsplitAlgorithm::new();
        let vote2 = algo2.on_node_list(&ctx(2, TieBreaker::Lowest), NodeListKind::Membership, 1, &[2], &view);
        assert_eq!(vote2, Vote::Nack);
    }

    #[test]
    fn sibling_partition_of_same_ring_is_held_consistent() {
        let mut algo = FfsplitAlgorithm::new();
        let view = FixedView { configured: vec![1, 2, 3] };
        let first = algo.on_node_list(&ctx(1, TieBreaker::Lowest), NodeListKind::Membership, 7, &[1, 2], &view);
        assert_eq!(first, Vote::Ack);

        // A sibling reporting a different partition of the same ring must not also get ACK.
        let second = algo.on_node_list(&ctx(3, TieBreaker::Lowest), NodeListKind::Membership, 7, &[3], &view);
        assert_eq!(second, Vote::Nack);
    }
}
