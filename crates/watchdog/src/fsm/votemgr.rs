//! Quorum arithmetic and failover-vote consensus.
//!
//! Lives on the coordinator only: proposals are created on the first vote
//! for a `(kind, backend-set)` pair and destroyed on consensus, rejection
//! or expiry.

use std::collections::HashSet;

use tracing::{debug, info};

use pgward_types::consensus::{request_flags, FailoverKind};
use pgward_types::node::{NodeId, LOCAL_NODE_ID};

use crate::net::{Clock, LocalDuration, LocalTime};

/// Proposals older than this are dropped.
pub const PROPOSAL_TTL: LocalDuration = LocalDuration::from_secs(15);

/// Consensus configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Failovers need the cluster to hold the quorum.
    pub require_quorum: bool,
    /// Failovers need a majority of votes, not just the quorum.
    pub require_consensus: bool,
    /// With an even node count, accept exactly half the votes as quorum
    /// and consensus.
    pub enable_consensus_with_half_votes: bool,
    /// Count repeated votes from the same node.
    pub allow_multiple_failover_requests_from_node: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            require_quorum: true,
            require_consensus: true,
            enable_consensus_with_half_votes: false,
            allow_multiple_failover_requests_from_node: false,
        }
    }
}

/// The minimum number of remote nodes that must be standing by for the
/// cluster to hold the quorum. The local node counts as a pre-cast vote,
/// which is why this is one less than a majority of the total.
pub fn min_remote_nodes_for_quorum(remote_count: u32) -> u32 {
    if remote_count % 2 == 0 {
        remote_count / 2
    } else {
        (remote_count - 1) / 2
    }
}

/// The number of votes a failover proposal needs.
///
/// Unlike the quorum, the local node's vote is not pre-cast here (it can
/// land on either side), so one more vote than
/// [`min_remote_nodes_for_quorum`] is needed, and another one on top when
/// the total node count is even and half votes are not acceptable.
pub fn minimum_votes_for_consensus(remote_count: u32, half_votes: bool) -> u32 {
    let mut required = min_remote_nodes_for_quorum(remote_count) + 1;

    if remote_count % 2 != 0 && !half_votes {
        required += 1;
    }
    required
}

/// Quorum status for a given standby count: `1` above the edge, `0` exactly
/// on the edge (even total with half the nodes alive), `-1` lost.
pub fn quorum_status(standby_count: u32, remote_count: u32, half_votes: bool) -> i32 {
    let minimum = min_remote_nodes_for_quorum(remote_count);

    if standby_count > minimum {
        1
    } else if standby_count == minimum {
        if remote_count % 2 != 0 {
            // Total node count is even; half the cluster is exactly the edge.
            if half_votes {
                0
            } else {
                -1
            }
        } else {
            1
        }
    } else {
        -1
    }
}

/// A pending failover proposal, identified by `(kind, backend-set)`.
#[derive(Debug)]
pub struct FailoverProposal {
    pub id: u32,
    pub kind: FailoverKind,
    /// Flags of the first vote; consensus proceeds with these.
    pub flags: u8,
    pub node_ids: Vec<i32>,
    requestors: HashSet<NodeId>,
    pub request_count: u32,
    pub started_at: LocalTime,
}

impl FailoverProposal {
    fn matches(&self, kind: FailoverKind, node_ids: &[i32]) -> bool {
        self.kind == kind
            && self.node_ids.len() == node_ids.len()
            && node_ids.iter().all(|id| self.node_ids.contains(id))
    }

    /// Whether the local node voted for this proposal.
    pub fn has_local_vote(&self) -> bool {
        self.requestors.contains(&LOCAL_NODE_ID)
    }
}

/// Outcome of feeding one vote into the consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusOutcome {
    /// Execute the failover, with the given (first-vote) flags.
    Proceed { flags: u8 },
    /// The quorum is absent; the request is rejected.
    NoQuorum,
    /// Vote recorded, waiting for more.
    BuildingConsensus,
    /// Duplicate vote that did not count.
    ConsensusMayFail,
}

/// Collects failover votes on the coordinator.
#[derive(Debug)]
pub struct FailoverManager<C> {
    pub config: Config,
    proposals: Vec<FailoverProposal>,
    next_id: u32,
    clock: C,
}

impl<C: Clock> FailoverManager<C> {
    pub fn new(config: Config, clock: C) -> Self {
        Self {
            config,
            proposals: Vec::new(),
            next_id: 0,
            clock,
        }
    }

    /// Feed one failover vote in and decide what happens to the request.
    ///
    /// `quorum` is the current cluster quorum status, freshly recomputed by
    /// the caller; `remote_count` the number of configured remote nodes.
    pub fn compute_consensus(
        &mut self,
        kind: FailoverKind,
        node_ids: &[i32],
        flags: u8,
        requestor: NodeId,
        quorum: i32,
        remote_count: u32,
    ) -> ConsensusOutcome {
        if !self.config.require_quorum {
            info!(target: "wd", "failover does not require the quorum, proceeding");
            return ConsensusOutcome::Proceed { flags };
        }
        if flags & request_flags::CONFIRMED != 0 {
            info!(target: "wd", "failover request is pre-confirmed, proceeding");
            return ConsensusOutcome::Proceed { flags };
        }
        if quorum < 0 {
            info!(target: "wd", "failover requires the quorum, which is not present");
            return ConsensusOutcome::NoQuorum;
        }
        if !self.config.require_consensus {
            info!(target: "wd", "failover does not require majority votes, proceeding");
            return ConsensusOutcome::Proceed { flags };
        }

        let minimum = minimum_votes_for_consensus(
            remote_count,
            self.config.enable_consensus_with_half_votes,
        );
        let (index, duplicate) = self.register_vote(kind, node_ids, flags, requestor);
        let proposal = &self.proposals[index];

        if proposal.request_count >= minimum {
            info!(
                target: "wd",
                "consensus on {} failover reached with {} vote(s)",
                kind,
                proposal.request_count,
            );
            let flags = proposal.flags;

            self.proposals.remove(index);
            return ConsensusOutcome::Proceed { flags };
        }

        debug!(
            target: "wd",
            "failover proposal {} has {}/{} vote(s)",
            self.proposals[index].id,
            self.proposals[index].request_count,
            minimum,
        );
        if duplicate && !self.config.allow_multiple_failover_requests_from_node {
            ConsensusOutcome::ConsensusMayFail
        } else {
            ConsensusOutcome::BuildingConsensus
        }
    }

    /// Record a vote, creating the proposal on first sight. Returns the
    /// proposal index and whether the vote was a duplicate.
    fn register_vote(
        &mut self,
        kind: FailoverKind,
        node_ids: &[i32],
        flags: u8,
        requestor: NodeId,
    ) -> (usize, bool) {
        let now = self.clock.local_time();

        if let Some(index) = self.proposals.iter().position(|p| p.matches(kind, node_ids)) {
            let proposal = &mut self.proposals[index];

            if !proposal.requestors.insert(requestor) {
                // Same node voting again.
                if self.config.allow_multiple_failover_requests_from_node {
                    proposal.request_count += 1;
                    debug!(
                        target: "wd",
                        "counting repeated failover vote from node {}", requestor
                    );
                } else {
                    debug!(
                        target: "wd",
                        "ignoring repeated failover vote from node {}", requestor
                    );
                }
                return (index, true);
            }
            proposal.request_count += 1;
            return (index, false);
        }

        self.next_id = self.next_id.wrapping_add(1);
        self.proposals.push(FailoverProposal {
            id: self.next_id,
            kind,
            flags,
            node_ids: node_ids.to_vec(),
            requestors: HashSet::from([requestor]),
            request_count: 1,
            started_at: now,
        });
        (self.proposals.len() - 1, false)
    }

    /// Drop proposals past their TTL. Returns the expired proposals; the
    /// caller checks them against the local quarantine state to decide on
    /// resignation.
    pub fn expire(&mut self) -> Vec<FailoverProposal> {
        let now = self.clock.local_time();
        let mut expired = Vec::new();
        let mut index = 0;

        while index < self.proposals.len() {
            if now - self.proposals[index].started_at >= PROPOSAL_TTL {
                let proposal = self.proposals.remove(index);

                debug!(
                    target: "wd",
                    "failover proposal {} with {} vote(s) expired",
                    proposal.id,
                    proposal.request_count,
                );
                expired.push(proposal);
                continue;
            }
            index += 1;
        }
        expired
    }

    /// Drop every proposal. Called when leaving the coordinator state.
    pub fn clear(&mut self) {
        self.proposals.clear();
    }

    /// Number of pending proposals.
    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::RefClock;

    fn manager(config: Config) -> (FailoverManager<RefClock>, RefClock) {
        let clock = RefClock::new(LocalTime::from_secs(100));
        (FailoverManager::new(config, clock.clone()), clock)
    }

    #[test]
    fn quorum_formula() {
        // Total 4 nodes (3 remote): edge is 1 standby.
        assert_eq!(min_remote_nodes_for_quorum(3), 1);
        // Total 5 nodes (4 remote): edge is 2 standbys.
        assert_eq!(min_remote_nodes_for_quorum(4), 2);

        // Odd total: exactly the minimum is a clean quorum.
        assert_eq!(quorum_status(2, 4, false), 1);
        assert_eq!(quorum_status(1, 4, false), -1);

        // Even total: the edge depends on half-vote acceptance.
        assert_eq!(quorum_status(1, 3, false), -1);
        assert_eq!(quorum_status(1, 3, true), 0);
        assert_eq!(quorum_status(2, 3, true), 1);
        assert_eq!(quorum_status(0, 3, true), -1);
    }

    #[test]
    fn vote_minimum_formula() {
        // Total 4 nodes: 3 votes unless half votes are acceptable.
        assert_eq!(minimum_votes_for_consensus(3, false), 3);
        assert_eq!(minimum_votes_for_consensus(3, true), 2);
        // Total 5 nodes: strict majority either way.
        assert_eq!(minimum_votes_for_consensus(4, false), 3);
        assert_eq!(minimum_votes_for_consensus(4, true), 3);
    }

    /// Four-node cluster: two remote votes plus the coordinator's own make
    /// consensus; two alone keep building.
    #[test]
    fn consensus_with_four_nodes() {
        let (mut mgr, _) = manager(Config::default());
        let remote = 3;

        assert_eq!(
            mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, 1, 1, remote),
            ConsensusOutcome::BuildingConsensus
        );
        assert_eq!(
            mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, 2, 1, remote),
            ConsensusOutcome::BuildingConsensus
        );
        assert_eq!(
            mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, LOCAL_NODE_ID, 1, remote),
            ConsensusOutcome::Proceed { flags: 0 }
        );
        // The proposal is destroyed on consensus.
        assert!(mgr.is_empty());
    }

    #[test]
    fn duplicate_votes_do_not_count_by_default() {
        let (mut mgr, _) = manager(Config::default());

        mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, 1, 1, 3);
        assert_eq!(
            mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, 1, 1, 3),
            ConsensusOutcome::ConsensusMayFail
        );
        assert_eq!(mgr.proposals[0].request_count, 1);
    }

    #[test]
    fn duplicate_votes_count_when_allowed() {
        let (mut mgr, _) = manager(Config {
            allow_multiple_failover_requests_from_node: true,
            ..Config::default()
        });

        mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, 1, 1, 3);
        mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, 1, 1, 3);
        assert_eq!(
            mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, 1, 1, 3),
            ConsensusOutcome::Proceed { flags: 0 }
        );
    }

    #[test]
    fn confirmed_requests_bypass_consensus() {
        let (mut mgr, _) = manager(Config::default());

        assert_eq!(
            mgr.compute_consensus(
                FailoverKind::NodeDown,
                &[0],
                request_flags::CONFIRMED,
                1,
                -1,
                3,
            ),
            ConsensusOutcome::Proceed {
                flags: request_flags::CONFIRMED
            }
        );
    }

    #[test]
    fn no_quorum_rejects() {
        let (mut mgr, _) = manager(Config::default());

        assert_eq!(
            mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, 1, -1, 3),
            ConsensusOutcome::NoQuorum
        );
    }

    #[test]
    fn proposal_identity_is_kind_and_node_set() {
        let (mut mgr, _) = manager(Config::default());

        mgr.compute_consensus(FailoverKind::NodeDown, &[0, 1], 0, 1, 1, 6);
        // Same backends, different order: the same proposal.
        mgr.compute_consensus(FailoverKind::NodeDown, &[1, 0], 0, 2, 1, 6);
        // Different kind: a separate proposal.
        mgr.compute_consensus(FailoverKind::NodePromote, &[0, 1], 0, 3, 1, 6);

        assert_eq!(mgr.len(), 2);
        assert_eq!(mgr.proposals[0].request_count, 2);
    }

    #[test]
    fn proposals_expire_after_ttl() {
        let (mut mgr, clock) = manager(Config::default());

        mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, LOCAL_NODE_ID, 1, 5);
        clock.elapse(LocalDuration::from_secs(14));
        assert!(mgr.expire().is_empty());

        clock.elapse(LocalDuration::from_secs(1));
        let expired = mgr.expire();

        assert_eq!(expired.len(), 1);
        assert!(expired[0].has_local_vote());
        assert!(mgr.is_empty());
    }

    #[test]
    fn first_vote_flags_win() {
        let (mut mgr, _) = manager(Config {
            enable_consensus_with_half_votes: true,
            ..Config::default()
        });

        // Total 4 nodes with half votes: 2 votes suffice.
        mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0x40, 1, 1, 3);
        let outcome = mgr.compute_consensus(FailoverKind::NodeDown, &[0], 0, 2, 1, 3);

        assert_eq!(outcome, ConsensusOutcome::Proceed { flags: 0x40 });
    }
}
