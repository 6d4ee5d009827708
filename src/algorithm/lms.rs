// This file is part of qnet-arbiter.

use super::{Algorithm, ClusterView, NodeListKind, SessionContext, Vote, LMS_ID};
use std::collections::HashMap;

/// Last-man-standing: at most one partition holds ACK per cluster at any time. That partition
/// is whichever one still contains a member of the previous ACK-holding partition; once none
/// of the previous holder's nodes are visible anywhere, the ACK moves to the smallest
/// surviving partition under the configured tie-breaker.
pub struct LmsAlgorithm {
    /// cluster -> sorted node-id set of the partition currently holding ACK.
    holders: HashMap<String, Vec<u32>>,
}

impl LmsAlgorithm {
    pub fn new() -> LmsAlgorithm {
        LmsAlgorithm {
            holders: HashMap::new(),
        }
    }

    fn decide(&mut self, ctx: &SessionContext, nodes: &[u32], view: &dyn ClusterView) -> Vote {
        let mut partition = nodes.to_vec();
        partition.sort_unstable();
        partition.dedup();

        let siblings = view.siblings(ctx.cluster_name, ctx.session);

        let new_holder = match self.holders.get(ctx.cluster_name) {
            None => partition.clone(),
            Some(holder) => {
                let mut known_nodes = partition.clone();
                for (_, _, sibling_partition) in &siblings {
                    known_nodes.extend(sibling_partition.iter().copied());
                }
                let holder_still_present = holder.iter().any(|id| known_nodes.contains(id));

                if holder_still_present {
                    holder.clone()
                } else {
                    let mut smallest = partition.clone();
                    for (_, _, sibling_partition) in &siblings {
                        let smaller = sibling_partition.len() < smallest.len();
                        let tied_but_favored =
                            sibling_partition.len() == smallest.len() && ctx.tie_breaker.favors(&known_nodes, sibling_partition);
                        if smaller || tied_but_favored {
                            smallest = sibling_partition.clone();
                        }
                    }
                    smallest
                }
            }
        };

        self.holders.insert(ctx.cluster_name.to_string(), new_holder.clone());

        if new_holder == partition {
            Vote::Ack
        } else {
            Vote::Nack
        }
    }
}

impl Algorithm for LmsAlgorithm {
    fn id(&self) -> u8 {
        LMS_ID
    }

    fn name(&self) -> &'static str {
        "LMS"
    }

    fn disconnect(&mut self, ctx: &SessionContext, _server_going_down: bool) {
        self.holders.remove(ctx.cluster_name);
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
        self.decide(ctx, nodes, view)
    }

    fn on_ask_for_vote(&mut self, ctx: &SessionContext, _ring_id: u64, view: &dyn ClusterView) -> Vote {
        if ctx.heuristics_failed {
            return Vote::Nack;
        }
        self.decide(ctx, &[ctx.node_id], view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::TieBreaker;

    struct SiblingView {
        siblings: Vec<(usize, u32, Vec<u32>)>,
    }
    impl ClusterView for SiblingView {
        fn configured_nodes(&self, _cluster_name: &str) -> Vec<u32> {
            vec![]
        }
        fn siblings(&self, _cluster_name: &str, exclude: usize) -> Vec<(usize, u32, Vec<u32>)> {
            self.siblings.iter().filter(|(s, _, _)| *s != exclude).cloned().collect()
        }
    }

    fn ctx(session: usize, node_id: u32) -> SessionContext<'static> {
        SessionContext {
            session,
            cluster_name: "c",
            node_id,
            heuristics_failed: false,
            tie_breaker: TieBreaker::Lowest,
        }
    }

    #[test]
    fn first_reporting_partition_becomes_holder() {
        let mut algo = LmsAlgorithm::new();
        let view = SiblingView { siblings: vec![] };
        assert_eq!(
            algo.on_node_list(&ctx(1, 1), NodeListKind::Membership, 1, &[1, 2], &view),
            Vote::Ack
        );
    }

    #[test]
    fn only_one_partition_holds_ack_at_a_time() {
        let mut algo = LmsAlgorithm::new();
        let view_initial = SiblingView {
            siblings: vec![(2, 2, vec![1, 2])],
        };
        assert_eq!(
            algo.on_node_list(&ctx(1, 1), NodeListKind::Membership, 1, &[1, 2], &view_initial),
            Vote::Ack
        );

        // A split: node 1 sees only itself, node 3 (outside the prior partition) reports alone.
        let view_split = SiblingView {
            siblings: vec![(1, 1, vec![1])],
        };
        let vote_for_3 = algo.on_node_list(&ctx(3, 3), NodeListKind::Membership, 2, &[3], &view_split);
        // Node 1 was part of the previous holder and is still visible, so 3 must not also ACK.
        assert_eq!(vote_for_3, Vote::Nack);
    }
}
