// This file is part of qnet-arbiter.

//! Decision algorithms (component C7): pluggable strategies that turn a client event into an
//! ack/nack/defer vote. Each algorithm is one shared instance queried with per-session context
//! rather than one instance per client, since several algorithms (LMS in particular) must keep
//! cluster-wide state across sessions.

mod ffsplit;
mod lms;
mod test_algo;
mod two_node_lms;

pub use ffsplit::FfsplitAlgorithm;
pub use lms::LmsAlgorithm;
pub use test_algo::TestAlgorithm;
pub use two_node_lms::TwoNodeLmsAlgorithm;

use crate::cluster::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Ack,
    Nack,
    WaitForReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeListKind {
    Membership,
    Quorum,
    Config,
    Initial,
}

/// The configured tie-breaker for an even split, per `AdvancedSettings::tie_breaker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreaker {
    Lowest,
    Highest,
    NodeId(u32),
}

impl TieBreaker {
    /// Whether this tie-breaker picks a member of `partition`.
    fn favors(&self, configured: &[u32], partition: &[u32]) -> bool {
        match self {
            TieBreaker::Lowest => configured.iter().min().map_or(false, |id| partition.contains(id)),
            TieBreaker::Highest => configured.iter().max().map_or(false, |id| partition.contains(id)),
            TieBreaker::NodeId(id) => partition.contains(id),
        }
    }
}

/// Everything an algorithm needs to know about the session that triggered the current
/// callback. Cheap to construct; the instance builds one of these per call from the client
/// session record.
pub struct SessionContext<'a> {
    pub session: SessionId,
    pub cluster_name: &'a str,
    pub node_id: u32,
    pub heuristics_failed: bool,
    pub tie_breaker: TieBreaker,
}

/// Cross-session facts about the rest of a cluster, backed by the cluster registry (C6) and
/// the client table, without giving the algorithm ownership of either.
pub trait ClusterView {
    fn configured_nodes(&self, cluster_name: &str) -> Vec<u32>;
    /// `(session, node_id, last_announced_partition)` for every other session in the cluster.
    fn siblings(&self, cluster_name: &str, exclude: SessionId) -> Vec<(SessionId, u32, Vec<u32>)>;
}

/// A decision algorithm. Most callbacks are no-ops for most algorithms, hence the default
/// bodies; `on_node_list` and `on_ask_for_vote` are where the actual voting logic lives.
pub trait Algorithm {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;

    fn init(&mut self, _ctx: &SessionContext) {}
    fn disconnect(&mut self, _ctx: &SessionContext, _server_going_down: bool) {}
    fn on_preinit_reply(&mut self, _ctx: &SessionContext) {}
    fn on_init_reply(&mut self, _ctx: &SessionContext) {}
    fn on_set_option_reply(&mut self, _ctx: &SessionContext) {}
    fn on_vote_info_reply(&mut self, _ctx: &SessionContext) {}
    fn on_timer(&mut self, _ctx: &SessionContext) -> Vote {
        Vote::Ack
    }

    fn on_node_list(
        &mut self,
        ctx: &SessionContext,
        kind: NodeListKind,
        ring_id: u64,
        nodes: &[u32],
        view: &dyn ClusterView,
    ) -> Vote;

    fn on_ask_for_vote(&mut self, ctx: &SessionContext, ring_id: u64, view: &dyn ClusterView) -> Vote;

    fn on_heuristics_change(&mut self, ctx: &SessionContext, failed: bool) -> Vote {
        if failed {
            Vote::Nack
        } else {
            Vote::Ack
        }
    }
}

/// Static, ordered algorithm list advertised in `PREINIT_REPLY`, matching
/// `qnetd_static_supported_decision_algorithms`'s fixed ordering in the original C source.
pub fn supported() -> Vec<Box<dyn Algorithm>> {
    vec![
        Box::new(TestAlgorithm::new()),
        Box::new(FfsplitAlgorithm::new()),
        Box::new(TwoNodeLmsAlgorithm::new()),
        Box::new(LmsAlgorithm::new()),
    ]
}

pub const TEST_ID: u8 = 0;
pub const FFSPLIT_ID: u8 = 1;
pub const TWO_NODE_LMS_ID: u8 = 2;
pub const LMS_ID: u8 = 3;

/// The ids advertised in `PREINIT_REPLY`, in the fixed order above, without allocating a
/// fresh algorithm instance just to read its id.
pub const SUPPORTED_IDS: [u8; 4] = [TEST_ID, FFSPLIT_ID, TWO_NODE_LMS_ID, LMS_ID];
