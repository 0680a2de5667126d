//! Cluster events surfaced to the outside world.
//!
//! The reactor publishes these on a channel; the IPC server forwards them
//! to every client registered for notifications.

use std::fmt;

use pgward_types::consensus::FailoverKind;
use pgward_types::node::{NodeId, NodeState};

/// A watchdog cluster event.
#[derive(Debug, Clone)]
pub enum Event {
    /// The state machine is about to start network activity.
    Initializing,
    /// The local node changed state.
    StateChanged { old: NodeState, new: NodeState },
    /// The cluster quorum status changed.
    QuorumChanged { status: i32 },
    /// The local node acquired or released the escalation (virtual IP).
    EscalationChanged { escalated: bool },
    /// A remote node became unreachable.
    NodeLost { node: NodeId, name: String },
    /// A remote node became reachable again.
    NodeFound { node: NodeId, name: String },
    /// Two coordinators were observed at once.
    SplitBrainDetected { node: NodeId },
    /// A failover on the coordinator finished; the middleware should
    /// resynchronize its backend states with the cluster.
    SyncBackendStates,
    /// The coordinator is collecting failover votes; the middleware should
    /// re-send failover requests for backends it has quarantined.
    InformQuarantinedNodes,
    /// Consensus was reached on a remote request; the local middleware must
    /// execute the failover on the cluster's behalf.
    ExecuteFailover {
        kind: FailoverKind,
        node_ids: Vec<i32>,
        flags: u8,
    },
    /// An invariant cannot hold; the process must exit without restart.
    Fatal { reason: String },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "watchdog is initializing"),
            Self::StateChanged { old, new } => {
                write!(f, "local node state changed from [{}] to [{}]", old, new)
            }
            Self::QuorumChanged { status } => write!(f, "quorum status changed to {}", status),
            Self::EscalationChanged { escalated } => {
                if *escalated {
                    write!(f, "node has escalated")
                } else {
                    write!(f, "node has de-escalated")
                }
            }
            Self::NodeLost { node, name } => write!(f, "remote node \"{}\" ({}) is lost", name, node),
            Self::NodeFound { node, name } => {
                write!(f, "remote node \"{}\" ({}) became reachable", name, node)
            }
            Self::SplitBrainDetected { node } => {
                write!(f, "split-brain detected with node {}", node)
            }
            Self::SyncBackendStates => write!(f, "backend states need to be synchronized"),
            Self::InformQuarantinedNodes => {
                write!(f, "failover requests for quarantined backends are wanted")
            }
            Self::ExecuteFailover { kind, node_ids, .. } => {
                write!(f, "executing {} failover for backends {:?}", kind, node_ids)
            }
            Self::Fatal { reason } => write!(f, "fatal: {}", reason),
        }
    }
}
