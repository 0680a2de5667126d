use eyre::{Context, OptionExt};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};

use pgward_types::node::NodeProfile;
use pgward_watchdog::fsm::peermgr::PeerConfig;

/// Default election priority of a node.
pub const DEFAULT_PRIORITY: i16 = 1;

/// One watchdog node, local or remote.
#[derive(Serialize, Deserialize, Clone)]
pub struct NodeEntry {
    /// Node name, unique within the cluster.
    pub name: String,
    /// Host the node's watchdog listens on.
    pub host: String,
    /// Watchdog mesh port.
    pub wd_port: u16,
    /// Port of the middleware instance the watchdog fronts.
    pub app_port: u16,
    /// Election priority. Higher wins.
    #[serde(default = "default_priority")]
    pub priority: i16,
}

fn default_priority() -> i16 {
    DEFAULT_PRIORITY
}

impl NodeEntry {
    fn to_profile(&self) -> NodeProfile {
        NodeProfile {
            name: self.name.clone(),
            host: self.host.clone(),
            wd_port: self.wd_port,
            app_port: self.app_port,
            priority: self.priority,
            delegate_ip: String::new(),
        }
    }
}

/// The cluster topology: who we are and who the other nodes are.
#[derive(Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    /// The local node.
    pub node: NodeEntry,
    /// Every other watchdog node of the cluster.
    #[serde(default)]
    pub peers: Vec<NodeEntry>,
    /// Shared key authenticating peers and external IPC clients.
    #[serde(default)]
    pub auth_key: Option<String>,
}

impl ClusterConfig {
    /// The address the local watchdog listens on.
    pub fn listen_addr(&self) -> eyre::Result<SocketAddr> {
        format!("{}:{}", self.node.host, self.node.wd_port)
            .to_socket_addrs()
            .wrap_err("Failed to resolve the local watchdog address")?
            .next()
            .ok_or_eyre("No address found for the local watchdog")
    }

    pub fn local_profile(&self) -> NodeProfile {
        self.node.to_profile()
    }

    /// Resolve every peer to its watchdog address.
    pub fn peer_configs(&self) -> eyre::Result<Vec<PeerConfig>> {
        self.peers
            .iter()
            .map(|peer| {
                let addr = format!("{}:{}", peer.host, peer.wd_port)
                    .to_socket_addrs()
                    .wrap_err_with(|| format!("Failed to resolve peer \"{}\"", peer.name))?
                    .next()
                    .ok_or_eyre("No address found for peer")?;

                Ok(PeerConfig {
                    profile: peer.to_profile(),
                    addr,
                })
            })
            .collect()
    }
}
