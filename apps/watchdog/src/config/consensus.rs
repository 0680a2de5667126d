use serde::Deserialize;

use pgward_watchdog::fsm::votemgr;

/// Failover consensus switches.
#[derive(Deserialize, Clone)]
pub struct ConsensusConfig {
    /// Failovers need the cluster to hold the quorum.
    #[serde(default = "default_true")]
    pub failover_when_quorum_exists: bool,

    /// Failovers need a majority of votes, not just the quorum.
    #[serde(default = "default_true")]
    pub failover_require_consensus: bool,

    /// With an even node count, accept exactly half the votes.
    #[serde(default)]
    pub enable_consensus_with_half_votes: bool,

    /// Count repeated failover requests from the same node.
    #[serde(default)]
    pub allow_multiple_failover_requests_from_node: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            failover_when_quorum_exists: true,
            failover_require_consensus: true,
            enable_consensus_with_half_votes: false,
            allow_multiple_failover_requests_from_node: false,
        }
    }
}

impl ConsensusConfig {
    pub fn to_vote_config(&self) -> votemgr::Config {
        votemgr::Config {
            require_quorum: self.failover_when_quorum_exists,
            require_consensus: self.failover_require_consensus,
            enable_consensus_with_half_votes: self.enable_consensus_with_half_votes,
            allow_multiple_failover_requests_from_node: self
                .allow_multiple_failover_requests_from_node,
        }
    }
}
