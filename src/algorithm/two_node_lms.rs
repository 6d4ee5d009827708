// This file is part of qnet-arbiter.

use super::{Algorithm, ClusterView, NodeListKind, SessionContext, Vote, TWO_NODE_LMS_ID};
use std::collections::HashMap;

/// Two-node last-man-standing: valid only for clusters with exactly two configured nodes.
/// Both sides ACK while quorate together; on a split the lone remaining side ACKs; if both
/// sides end up alone at once, the stable tie-breaker (lowest configured id) wins, matching
/// the "last man" rule for the degenerate two-node case the original `2nodelms` algorithm
/// exists for.
pub struct TwoNodeLmsAlgorithm {
    /// cluster -> node id that currently holds the ACK, once a split has occurred.
    last_man: HashMap<String, u32>,
}

impl TwoNodeLmsAlgorithm {
    pub fn new() -> TwoNodeLmsAlgorithm {
        TwoNodeLmsAlgorithm {
            last_man: HashMap::new(),
        }
    }
}

impl Algorithm for TwoNodeLmsAlgorithm {
    fn id(&self) -> u8 {
        TWO_NODE_LMS_ID
    }

    fn name(&self) -> &'static str {
        "2NodeLMS"
    }

    fn disconnect(&mut self, ctx: &SessionContext, _server_going_down: bool) {
        self.last_man.remove(ctx.cluster_name);
    }

    fn on_node_list(
        &mut self,
        ctx: &SessionContext,
        kind: NodeListKind,
        _ring_id: u64,
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
        if configured.len() != 2 {
            return Vote::Nack;
        }

        if nodes.len() >= 2 {
            // Quorate together: both sides get ACK, no last-man state to track yet.
            self.last_man.remove(ctx.cluster_name);
            return Vote::Ack;
        }

        // Alone. Whoever is already recorded as last man keeps it; otherwise the
        // tie-breaker (lowest configured id, per the stable rule) claims it.
        let holder = *self
            .last_man
            .entry(ctx.cluster_name.to_string())
            .or_insert_with(|| *configured.iter().min().unwrap_or(&ctx.node_id));

        if holder == ctx.node_id {
            Vote::Ack
        } else {
            Vote::Nack
        }
    }

    fn on_ask_for_vote(&mut self, ctx: &SessionContext, ring_id: u64, view: &dyn ClusterView) -> Vote {
        self.on_node_list(ctx, NodeListKind::Membership, ring_id, &[ctx.node_id], view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::TieBreaker;

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

    fn ctx(node_id: u32) -> SessionContext<'static> {
        SessionContext {
            session: node_id as usize,
            cluster_name: "c",
            node_id,
            heuristics_failed: false,
            tie_breaker: TieBreaker::Lowest,
        }
    }

    #[test]
    fn both_ack_while_quorate_together() {
        let mut algo = TwoNodeLmsAlgorithm::new();
        let view = FixedView { configured: vec![1, 2] };
        assert_eq!(
            algo.on_node_list(&ctx(1), NodeListKind::Membership, 1, &[1, 2], &view),
            Vote::Ack
        );
    }

    #[test]
    fn sole_survivor_acks_on_split() {
        let mut algo = TwoNodeLmsAlgorithm::new();
        let view = FixedView { configured: vec![1, 2] };
        assert_eq!(
            algo.on_node_list(&ctx(1), NodeListKind::Membership, 1, &[1], &view),
            Vote::Ack
        );
    }

    #[test]
    fn lowest_id_wins_when_both_sides_alone() {
        let mut algo = TwoNodeLmsAlgorithm::new();
        let view = FixedView { configured: vec![1, 2] };
        assert_eq!(
            algo.on_node_list(&ctx(2), NodeListKind::Membership, 1, &[2], &view),
            Vote::Nack
        );
        assert_eq!(
            algo.on_node_list(&ctx(1), NodeListKind::Membership, 1, &[1], &view),
            Vote::Ack
        );
    }
}
