//! Peer table and connection management.
//!
//! Every configured remote watchdog owns a slot with a stable 1-based id
//! and up to two live connections: the outbound one we dial to its
//! configured address, and the inbound one it dialed to us. Either link
//! carries traffic; a peer is reachable while at least one is up.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, warn};

use pgward_types::node::{NodeId, NodeProfile, NodeSnapshot, NodeState};

use crate::fsm::output::{Connect, Disconnect, SetTimer, Wire};
use crate::fsm::handler::DisconnectReason;
use crate::net::{Clock, Link, LocalDuration, LocalTime};

/// A peer that was sent a command packet must reply within this window
/// before it is considered lost.
pub const NODE_REPLY_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// Minimum time to wait between outbound reconnection attempts.
pub const RETRY_MIN_WAIT: LocalDuration = LocalDuration::from_secs(10);
/// Maximum time to wait between outbound reconnection attempts.
pub const RETRY_MAX_WAIT: LocalDuration = LocalDuration::from_secs(300);
/// Time an accepted connection has to deliver its `AddNode` before we hang
/// up on it.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);

/// A configured remote watchdog.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub profile: NodeProfile,
    /// Resolved watchdog address of the peer.
    pub addr: SocketAddr,
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The remote peers, in configuration order. Slot ids start at 1.
    pub peers: Vec<PeerConfig>,
    /// Shared key authenticating `AddNode`/`Info` payloads, when set.
    pub auth_key: Option<String>,
}

/// A remote watchdog node.
#[derive(Debug)]
pub struct RemotePeer {
    /// Stable 1-based id of this peer.
    pub id: NodeId,
    pub profile: NodeProfile,
    /// The peer's configured watchdog address; the outbound link dials it.
    pub addr: SocketAddr,
    pub state: NodeState,
    pub startup_time: LocalTime,
    pub current_state_since: LocalTime,
    pub quorum_status: i32,
    pub standby_count: u32,
    pub escalated: bool,
    /// Whether the beacon fields above were ever populated. Peers running
    /// an older protocol never fill them, which matters to the split-brain
    /// tiebreak.
    pub beacon_seen: bool,
    /// Last time any packet arrived from this peer.
    pub last_recv: Option<LocalTime>,
    /// Set when a tracked packet was sent and no reply arrived yet.
    pub last_sent: Option<LocalTime>,
    /// Address of the accepted connection from this peer, when identified.
    inbound: Option<SocketAddr>,
    /// Whether the outbound link (at `addr`) is established.
    outbound: bool,
    /// An outbound connect is in flight.
    connecting: bool,
    retry_at: Option<LocalTime>,
    retry_attempts: u32,
}

impl RemotePeer {
    fn new(id: NodeId, config: &PeerConfig, now: LocalTime) -> Self {
        Self {
            id,
            profile: config.profile.clone(),
            addr: config.addr,
            state: NodeState::Dead,
            startup_time: now,
            current_state_since: now,
            quorum_status: -1,
            standby_count: 0,
            escalated: false,
            beacon_seen: false,
            last_recv: None,
            last_sent: None,
            inbound: None,
            outbound: false,
            connecting: false,
            retry_at: None,
            retry_attempts: 0,
        }
    }

    /// At least one of the two links is up.
    pub fn is_reachable(&self) -> bool {
        self.outbound || self.inbound.is_some()
    }

    /// The peer takes part in the cluster.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// The preferred address to send to: the outbound link when up,
    /// otherwise the inbound one.
    pub fn send_addr(&self) -> Option<SocketAddr> {
        if self.outbound {
            Some(self.addr)
        } else {
            self.inbound
        }
    }

    /// Addresses of all live links.
    pub fn link_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::with_capacity(2);
        if self.outbound {
            addrs.push(self.addr);
        }
        if let Some(inbound) = self.inbound {
            addrs.push(inbound);
        }
        addrs
    }
}

/// What an established connection turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connected {
    /// Our dial to a configured peer completed.
    Outbound(NodeId),
    /// An accepted connection awaiting its `AddNode`.
    InboundPending,
    /// A connection we know nothing about.
    Unknown,
}

/// Why an `AddNode` was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyError {
    /// The sender matches no configured peer.
    UnknownNode,
    /// The authentication hash was missing or wrong.
    AuthFailed,
}

/// Manages the peer table.
#[derive(Debug)]
pub struct PeerManager<U, C> {
    pub config: Config,
    peers: Vec<RemotePeer>,
    /// Identified inbound connections, by source address.
    inbound_index: HashMap<SocketAddr, NodeId>,
    /// Accepted connections that have not sent `AddNode` yet.
    unidentified: HashMap<SocketAddr, LocalTime>,
    upstream: U,
    clock: C,
}

impl<U, C: Clock> PeerManager<U, C> {
    /// Create a new peer manager.
    pub fn new(config: Config, upstream: U, clock: C) -> Self {
        let now = clock.local_time();
        let peers = config
            .peers
            .iter()
            .enumerate()
            .map(|(i, peer)| RemotePeer::new(i as NodeId + 1, peer, now))
            .collect();

        Self {
            config,
            peers,
            inbound_index: HashMap::new(),
            unidentified: HashMap::new(),
            upstream,
            clock,
        }
    }

    /// The number of configured remote nodes.
    pub fn remote_count(&self) -> u32 {
        self.peers.len() as u32
    }

    pub fn get(&self, id: NodeId) -> Option<&RemotePeer> {
        id.checked_sub(1).and_then(|i| self.peers.get(i as usize))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut RemotePeer> {
        id.checked_sub(1)
            .and_then(|i| self.peers.get_mut(i as usize))
    }

    /// Iterator over all configured peers.
    pub fn iter(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.iter()
    }

    /// Peers that are active and reachable.
    pub fn active(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.iter().filter(|p| p.is_active() && p.is_reachable())
    }

    /// The number of active, reachable peers.
    pub fn active_count(&self) -> u32 {
        self.active().count() as u32
    }

    /// The peer an established connection belongs to, if identified.
    pub fn node_by_addr(&self, addr: &SocketAddr) -> Option<NodeId> {
        if let Some(id) = self.inbound_index.get(addr) {
            return Some(*id);
        }
        self.peers
            .iter()
            .find(|p| p.addr == *addr && p.outbound)
            .map(|p| p.id)
    }

    /// An outbound connection attempt is underway.
    pub fn attempted(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.addr == *addr) {
            peer.connecting = true;
        }
    }

    /// Check a snapshot's authentication hash against the configured key.
    pub fn verify_auth(&self, snapshot: &NodeSnapshot) -> bool {
        let Some(key) = &self.config.auth_key else {
            return true;
        };
        let expected = wire_auth_hash(key, snapshot.state, snapshot.wd_port);

        snapshot.auth_hash.as_deref() == Some(expected.as_str())
    }

    /// Apply an `Info`/beacon snapshot to a peer. Returns the previous
    /// `(state, quorum_status)` pair.
    pub fn update_from_snapshot(
        &mut self,
        id: NodeId,
        snapshot: &NodeSnapshot,
    ) -> Option<(NodeState, i32)> {
        let now = self.clock.local_time();
        let peer = self.get_mut(id)?;
        let previous = (peer.state, peer.quorum_status);

        peer.state = snapshot.state;
        peer.profile.priority = snapshot.priority;
        peer.startup_time = now - LocalDuration::from_secs(snapshot.seconds_since_startup);
        peer.current_state_since =
            now - LocalDuration::from_secs(snapshot.seconds_since_state_change);
        peer.quorum_status = snapshot.quorum_status;
        peer.standby_count = snapshot.standby_count;
        peer.escalated = snapshot.escalated;
        peer.beacon_seen = true;

        Some(previous)
    }

    /// A packet arrived from the peer: it is alive, any pending reply wait
    /// is satisfied.
    pub fn packet_received(&mut self, id: NodeId) {
        let now = self.clock.local_time();

        if let Some(peer) = self.get_mut(id) {
            peer.last_recv = Some(now);
            peer.last_sent = None;
        }
    }

    /// A tracked packet went out to the peer; start the reply-timeout
    /// window unless one is already running.
    pub fn message_sent(&mut self, id: NodeId) {
        let now = self.clock.local_time();

        if let Some(peer) = self.get_mut(id) {
            peer.last_sent.get_or_insert(now);
        }
    }
}

impl<U: Wire + SetTimer + Connect + Disconnect, C: Clock> PeerManager<U, C> {
    /// Dial every configured peer. Must be called once.
    pub fn initialize(&mut self) {
        for peer in self.peers.iter_mut() {
            peer.connecting = true;
            self.upstream.connect(peer.addr);
        }
    }

    /// A connection was established.
    pub fn connected(&mut self, addr: SocketAddr, link: Link) -> Connected {
        match link {
            Link::Outbound => {
                let Some(peer) = self.peers.iter_mut().find(|p| p.addr == addr) else {
                    return Connected::Unknown;
                };

                peer.outbound = true;
                peer.connecting = false;
                peer.retry_at = None;
                peer.retry_attempts = 0;

                debug!(target: "wd", "connected to remote node \"{}\" at {}", peer.profile.name, addr);
                Connected::Outbound(peer.id)
            }
            Link::Inbound => {
                self.unidentified.insert(addr, self.clock.local_time());
                Connected::InboundPending
            }
        }
    }

    /// A connection went away. Returns the peer that has just become fully
    /// unreachable, if any.
    pub fn disconnected(&mut self, addr: &SocketAddr) -> Option<NodeId> {
        if self.unidentified.remove(addr).is_some() {
            return None;
        }

        if let Some(id) = self.inbound_index.remove(addr) {
            let peer = self.get_mut(id).expect("indexed peers exist");

            peer.inbound = None;
            if !peer.is_reachable() && peer.state.is_active() {
                return Some(id);
            }
            return None;
        }

        let now = self.clock.local_time();
        let peer = self.peers.iter_mut().find(|p| p.addr == *addr)?;
        let was_reachable = peer.is_reachable();

        peer.outbound = false;
        peer.connecting = false;

        // Schedule a retry with a bounded exponential backoff.
        let delay = (RETRY_MIN_WAIT * 2u64.saturating_pow(peer.retry_attempts))
            .clamp(RETRY_MIN_WAIT, RETRY_MAX_WAIT);
        peer.retry_at = Some(now + delay);
        peer.retry_attempts = peer.retry_attempts.saturating_add(1);
        self.upstream.set_timer(delay);

        if was_reachable && !peer.is_reachable() && peer.state.is_active() {
            Some(peer.id)
        } else {
            None
        }
    }

    /// An `AddNode` snapshot arrived on an unidentified connection. Matches
    /// it to a configured slot and verifies the authentication hash.
    pub fn identify(
        &mut self,
        addr: SocketAddr,
        snapshot: &NodeSnapshot,
    ) -> Result<NodeId, IdentifyError> {
        if !self.verify_auth(snapshot) {
            warn!(target: "wd", "authentication failed for node \"{}\"", snapshot.name);
            return Err(IdentifyError::AuthFailed);
        }

        let peer = self
            .peers
            .iter_mut()
            .find(|p| {
                p.profile.name == snapshot.name
                    || (p.profile.host == snapshot.host && p.profile.wd_port == snapshot.wd_port)
            })
            .ok_or(IdentifyError::UnknownNode)?;

        self.unidentified.remove(&addr);

        // The peer reconnected through a fresh socket; forget the old one.
        if let Some(old) = peer.inbound.replace(addr) {
            self.inbound_index.remove(&old);
        }
        self.inbound_index.insert(addr, peer.id);

        debug!(
            target: "wd",
            "remote node \"{}\" (id {}) identified itself from {}",
            peer.profile.name, peer.id, addr
        );
        Ok(peer.id)
    }

    /// Take a peer out of the cluster. Closes both links and returns their
    /// addresses so the caller can instruct the reactor.
    ///
    /// A peer that announced a clean shutdown keeps its `Shutdown` state
    /// rather than turning `Lost`.
    pub fn mark_lost(&mut self, id: NodeId) -> Vec<SocketAddr> {
        let Some(peer) = id
            .checked_sub(1)
            .and_then(|i| self.peers.get_mut(i as usize))
        else {
            return Vec::new();
        };
        let addrs = peer.link_addrs();

        if peer.state != NodeState::Shutdown {
            peer.state = NodeState::Lost;
        }
        peer.last_sent = None;
        peer.outbound = false;
        peer.connecting = false;
        if let Some(inbound) = peer.inbound.take() {
            self.inbound_index.remove(&inbound);
        }

        for addr in &addrs {
            self.upstream.disconnect(*addr, DisconnectReason::PeerLost);
        }
        addrs
    }

    /// Periodic sweep. Returns the peers whose reply window expired; the
    /// caller runs the node-lost path for them.
    pub fn received_wake(&mut self) -> Vec<NodeId> {
        let now = self.clock.local_time();
        let mut timed_out = Vec::new();

        for peer in self.peers.iter_mut() {
            // A node that does not answer within the reply window is gone,
            // even if its sockets look healthy.
            if let Some(sent) = peer.last_sent {
                if now - sent >= NODE_REPLY_TIMEOUT {
                    timed_out.push(peer.id);
                    continue;
                }
            }

            // Retry unreachable peers, observing the backoff.
            if !peer.is_reachable() && !peer.connecting {
                match peer.retry_at {
                    Some(at) if at > now => {}
                    _ => {
                        peer.retry_at = None;
                        peer.connecting = true;
                        self.upstream.connect(peer.addr);
                    }
                }
            }
        }

        // Drop accepted connections that never said who they are.
        let stale: Vec<SocketAddr> = self
            .unidentified
            .iter()
            .filter(|(_, since)| now - **since >= HANDSHAKE_TIMEOUT)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            self.unidentified.remove(&addr);
            self.upstream
                .disconnect(addr, DisconnectReason::HandshakeTimeout);
        }

        timed_out
    }
}

/// The authentication hash carried in `AddNode`/`Info` payloads:
/// `hex(HMAC-SHA256(auth_key, "state=<S> wd_port=<P>"))`.
pub fn wire_auth_hash(key: &str, state: NodeState, wd_port: u16) -> String {
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key.as_bytes());
    let message = format!("state={} wd_port={}", state.code(), wd_port);
    let tag = ring::hmac::sign(&key, message.as_bytes());

    hex::encode(tag.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Outbox;
    use crate::net::RefClock;

    fn profile(name: &str, port: u16) -> NodeProfile {
        NodeProfile {
            name: name.into(),
            host: "127.0.0.1".into(),
            wd_port: port,
            app_port: port + 1000,
            priority: 1,
            delegate_ip: String::new(),
        }
    }

    fn manager(count: u16) -> (PeerManager<Outbox, RefClock>, RefClock) {
        let clock = RefClock::new(LocalTime::from_secs(1000));
        let peers = (0..count)
            .map(|i| PeerConfig {
                profile: profile(&format!("wd{}", i + 1), 9000 + i),
                addr: ([127, 0, 0, 1], 9000 + i).into(),
            })
            .collect();

        let mgr = PeerManager::new(
            Config {
                peers,
                auth_key: None,
            },
            Outbox::new(),
            clock.clone(),
        );
        (mgr, clock)
    }

    fn snapshot(name: &str, port: u16, state: NodeState) -> NodeSnapshot {
        NodeSnapshot {
            name: name.into(),
            host: "127.0.0.1".into(),
            wd_port: port,
            app_port: port + 1000,
            priority: 1,
            state,
            seconds_since_startup: 10,
            seconds_since_state_change: 5,
            quorum_status: -1,
            standby_count: 0,
            escalated: false,
            delegate_ip: String::new(),
            auth_hash: None,
        }
    }

    #[test]
    fn either_link_keeps_the_peer_reachable() {
        let (mut mgr, _) = manager(1);
        let outbound: SocketAddr = ([127, 0, 0, 1], 9000).into();
        let inbound: SocketAddr = ([127, 0, 0, 1], 55555).into();

        assert_eq!(mgr.connected(outbound, Link::Outbound), Connected::Outbound(1));
        assert_eq!(mgr.connected(inbound, Link::Inbound), Connected::InboundPending);
        mgr.identify(inbound, &snapshot("wd1", 9000, NodeState::Loading))
            .unwrap();

        assert!(mgr.get(1).unwrap().is_reachable());
        assert_eq!(mgr.node_by_addr(&inbound), Some(1));
        assert_eq!(mgr.node_by_addr(&outbound), Some(1));

        // Losing one link keeps the peer reachable.
        assert_eq!(mgr.disconnected(&outbound), None);
        assert!(mgr.get(1).unwrap().is_reachable());

        // Losing the second makes it unreachable. The peer is active
        // (identified via its snapshot), so the caller is told.
        mgr.get_mut(1).unwrap().state = NodeState::Standby;
        assert_eq!(mgr.disconnected(&inbound), Some(1));
        assert!(!mgr.get(1).unwrap().is_reachable());
    }

    #[test]
    fn unknown_inbound_is_not_identified() {
        let (mut mgr, _) = manager(1);
        let inbound: SocketAddr = ([127, 0, 0, 1], 55555).into();

        mgr.connected(inbound, Link::Inbound);
        let err = mgr
            .identify(inbound, &snapshot("intruder", 1234, NodeState::Loading))
            .unwrap_err();

        assert_eq!(err, IdentifyError::UnknownNode);
    }

    #[test]
    fn auth_hash_is_enforced_when_configured() {
        let (mut mgr, _) = manager(1);
        mgr.config.auth_key = Some("secret".into());
        let inbound: SocketAddr = ([127, 0, 0, 1], 55555).into();
        mgr.connected(inbound, Link::Inbound);

        let mut unsigned = snapshot("wd1", 9000, NodeState::Loading);
        assert_eq!(
            mgr.identify(inbound, &unsigned),
            Err(IdentifyError::AuthFailed)
        );

        unsigned.auth_hash = Some(wire_auth_hash("secret", NodeState::Loading, 9000));
        assert!(mgr.identify(inbound, &unsigned).is_ok());
    }

    #[test]
    fn reply_timeout_marks_the_peer() {
        let (mut mgr, clock) = manager(1);
        let outbound: SocketAddr = ([127, 0, 0, 1], 9000).into();

        mgr.connected(outbound, Link::Outbound);
        mgr.get_mut(1).unwrap().state = NodeState::Standby;
        mgr.message_sent(1);

        clock.elapse(LocalDuration::from_secs(4));
        assert!(mgr.received_wake().is_empty());

        clock.elapse(LocalDuration::from_secs(2));
        assert_eq!(mgr.received_wake(), vec![1]);
    }

    #[test]
    fn a_reply_clears_the_wait() {
        let (mut mgr, clock) = manager(1);
        let outbound: SocketAddr = ([127, 0, 0, 1], 9000).into();

        mgr.connected(outbound, Link::Outbound);
        mgr.message_sent(1);
        clock.elapse(LocalDuration::from_secs(4));
        mgr.packet_received(1);
        clock.elapse(LocalDuration::from_secs(4));

        assert!(mgr.received_wake().is_empty());
    }

    #[test]
    fn reconnects_respect_the_minimum_backoff() {
        let (mut mgr, clock) = manager(1);
        let outbound: SocketAddr = ([127, 0, 0, 1], 9000).into();

        mgr.connected(outbound, Link::Outbound);
        mgr.disconnected(&outbound);

        // Too early: no reconnect yet.
        clock.elapse(LocalDuration::from_secs(5));
        mgr.received_wake();
        assert!(!mgr.get(1).unwrap().connecting);

        clock.elapse(LocalDuration::from_secs(6));
        mgr.received_wake();
        assert!(mgr.get(1).unwrap().connecting);
    }

    #[test]
    fn shutdown_state_survives_mark_lost() {
        let (mut mgr, _) = manager(1);
        let outbound: SocketAddr = ([127, 0, 0, 1], 9000).into();

        mgr.connected(outbound, Link::Outbound);
        mgr.get_mut(1).unwrap().state = NodeState::Shutdown;
        mgr.mark_lost(1);

        assert_eq!(mgr.get(1).unwrap().state, NodeState::Shutdown);

        mgr.connected(outbound, Link::Outbound);
        mgr.get_mut(1).unwrap().state = NodeState::Standby;
        mgr.mark_lost(1);

        assert_eq!(mgr.get(1).unwrap().state, NodeState::Lost);
    }
}
