// This file is part of qnet-arbiter.

use super::{Algorithm, ClusterView, NodeListKind, SessionContext, Vote, TEST_ID};

/// Always ACKs. Exists purely to exercise the plumbing end to end without requiring a
/// realistic cluster topology, the same role `qnetd-algo-test.c` plays in the original.
pub struct TestAlgorithm;

impl TestAlgorithm {
    pub fn new() -> TestAlgorithm {
        TestAlgorithm
    }
}

impl Algorithm for TestAlgorithm {
    fn id(&self) -> u8 {
        TEST_ID
    }

    fn name(&self) -> &'static str {
        "Test"
    }

    fn on_node_list(
        &mut self,
        _ctx: &SessionContext,
        _kind: NodeListKind,
        _ring_id: u64,
        _nodes: &[u32],
        _view: &dyn ClusterView,
    ) -> Vote {
        Vote::Ack
    }

    fn on_ask_for_vote(&mut self, _ctx: &SessionContext, _ring_id: u64, _view: &dyn ClusterView) -> Vote {
        Vote::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::TieBreaker;

    struct EmptyView;
    impl ClusterView for EmptyView {
        fn configured_nodes(&self, _cluster_name: &str) -> Vec<u32> {
            vec![]
        }
        fn siblings(&self, _cluster_name: &str, _exclude: usize) -> Vec<(usize, u32, Vec<u32>)> {
            vec![]
        }
    }

    #[test]
    fn always_acks() {
        let mut algo = TestAlgorithm::new();
        let ctx = SessionContext {
            session: 1,
            cluster_name: "c1",
            node_id: 1,
            heuristics_failed: false,
            tie_breaker: TieBreaker::Lowest,
        };
        let vote = algo.on_node_list(&ctx, NodeListKind::Membership, 1, &[1], &EmptyView);
        assert_eq!(vote, Vote::Ack);
    }
}
