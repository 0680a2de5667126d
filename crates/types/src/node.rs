//! Watchdog node model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a configured watchdog node. Remote peers are
/// numbered from 1 in configuration order; 0 always refers to the local
/// node on the IPC surface.
pub type NodeId = u32;

/// Node id reserved for the local node.
pub const LOCAL_NODE_ID: NodeId = 0;

/// Lifecycle state of a watchdog node.
///
/// The same enumeration describes both the local node (driven by the
/// election state machine) and the remote peers (tracked from their `Info`
/// snapshots).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Initial state of a configured peer before any contact.
    Dead,
    /// Our `AddNode` went out and we are waiting for the peer's `Info`.
    AddMessageSent,
    /// Collecting `Info` replies from the cluster after startup.
    Loading,
    /// Intermediate state before cluster initialization.
    Joining,
    /// Deciding whether to stand, join or follow an election.
    Initializing,
    /// The cluster coordinator (leader).
    Coordinator,
    /// Contesting the coordinatorship.
    StandingForCoordinator,
    /// Voting in somebody else's election.
    ParticipatingInElection,
    /// Following a coordinator in good standing.
    Standby,
    /// Both connections to the peer are down.
    Lost,
    /// The local network is gone.
    InNetworkTrouble,
    /// The node announced a clean shutdown.
    Shutdown,
}

impl NodeState {
    /// Whether a node in this state takes part in the cluster.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Dead | Self::Lost | Self::Shutdown)
    }

    /// Stable numeric code of this state. Part of the wire ABI: it feeds
    /// the authentication hash.
    pub fn code(&self) -> u8 {
        match self {
            Self::Dead => 0,
            Self::AddMessageSent => 1,
            Self::Loading => 2,
            Self::Joining => 3,
            Self::Initializing => 4,
            Self::Coordinator => 5,
            Self::StandingForCoordinator => 6,
            Self::ParticipatingInElection => 7,
            Self::Standby => 8,
            Self::Lost => 9,
            Self::InNetworkTrouble => 10,
            Self::Shutdown => 11,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dead => "DEAD",
            Self::AddMessageSent => "ADD MESSAGE SENT",
            Self::Loading => "LOADING",
            Self::Joining => "JOINING",
            Self::Initializing => "INITIALIZING",
            Self::Coordinator => "COORDINATOR",
            Self::StandingForCoordinator => "STANDING FOR COORDINATOR",
            Self::ParticipatingInElection => "PARTICIPATING IN ELECTION",
            Self::Standby => "STANDBY",
            Self::Lost => "LOST",
            Self::InNetworkTrouble => "IN NETWORK TROUBLE",
            Self::Shutdown => "SHUTDOWN",
        };
        write!(f, "{}", name)
    }
}

/// Static identity of a watchdog node, taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProfile {
    /// Node name, unique within the cluster.
    pub name: String,
    /// Host the watchdog listens on.
    pub host: String,
    /// Watchdog mesh port.
    pub wd_port: u16,
    /// Port of the middleware this watchdog fronts.
    pub app_port: u16,
    /// Election priority. Higher wins.
    pub priority: i16,
    /// Virtual IP owned by the cluster coordinator. May be empty.
    #[serde(default)]
    pub delegate_ip: String,
}

/// A point-in-time snapshot of a node, exchanged in `Info` messages and in
/// the coordinator beacon.
///
/// Times travel as "seconds ago" so that peers never have to agree on wall
/// clocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    #[serde(rename = "NodeName")]
    pub name: String,
    #[serde(rename = "HostName")]
    pub host: String,
    #[serde(rename = "WdPort")]
    pub wd_port: u16,
    #[serde(rename = "AppPort")]
    pub app_port: u16,
    #[serde(rename = "Priority")]
    pub priority: i16,
    #[serde(rename = "State")]
    pub state: NodeState,
    #[serde(rename = "SecondsSinceStartup")]
    pub seconds_since_startup: u64,
    #[serde(rename = "SecondsSinceStateChange")]
    pub seconds_since_state_change: u64,
    #[serde(rename = "QuorumStatus")]
    pub quorum_status: i32,
    #[serde(rename = "StandbyCount")]
    pub standby_count: u32,
    #[serde(rename = "Escalated")]
    pub escalated: bool,
    /// Populated by the coordinator once known; standbys echo it back.
    #[serde(rename = "DelegateIP", default, skip_serializing_if = "String::is_empty")]
    pub delegate_ip: String,
    /// HMAC over `"state=<S> wd_port=<P>"` when an auth key is configured.
    #[serde(rename = "AuthHash", default, skip_serializing_if = "Option::is_none")]
    pub auth_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(NodeState::Coordinator.is_active());
        assert!(NodeState::Loading.is_active());
        assert!(NodeState::AddMessageSent.is_active());
        assert!(!NodeState::Dead.is_active());
        assert!(!NodeState::Lost.is_active());
        assert!(!NodeState::Shutdown.is_active());
    }

    #[test]
    fn snapshot_json_roundtrip() {
        let snapshot = NodeSnapshot {
            name: "wd0".into(),
            host: "10.0.0.1".into(),
            wd_port: 9000,
            app_port: 9999,
            priority: 3,
            state: NodeState::Standby,
            seconds_since_startup: 120,
            seconds_since_state_change: 10,
            quorum_status: 1,
            standby_count: 2,
            escalated: false,
            delegate_ip: String::new(),
            auth_hash: None,
        };

        let json = serde_json::to_vec(&snapshot).unwrap();
        let parsed: NodeSnapshot = serde_json::from_slice(&json).unwrap();

        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn snapshot_tolerates_missing_optional_fields() {
        // An older peer may omit the delegate IP and the auth hash.
        let json = r#"{
            "NodeName": "wd1", "HostName": "10.0.0.2", "WdPort": 9000,
            "AppPort": 9999, "Priority": 1, "State": "Coordinator",
            "SecondsSinceStartup": 5, "SecondsSinceStateChange": 5,
            "QuorumStatus": -1, "StandbyCount": 0, "Escalated": false
        }"#;
        let parsed: NodeSnapshot = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.state, NodeState::Coordinator);
        assert!(parsed.delegate_ip.is_empty());
        assert!(parsed.auth_hash.is_none());
    }
}
