//! Watchdog coordination state machine.
//!
//! One instance per process. The reactor feeds it connections, packets and
//! a one-second tick; it drives the peer table, the election, the failover
//! consensus and the escalation helpers, and answers through its outbox.

use std::fmt;
use std::net::SocketAddr;

use flume as chan;
use tracing::{debug, info, warn};

use pgward_types::consensus::{request_flags, FailoverKind, FailoverResult};
use pgward_types::ipc::{
    FailoverIpcResponse, FailoverPhase, IpcCommandType, IpcResponse, NodeStatus, NodesListEntry,
    NodesListResponse, RuntimeValue, RuntimeVariable,
};
use pgward_types::messages::{
    BeaconPayload, ClusterServiceCode, DataRequest, MessageType, Packet, PoolConfigPayload,
    RecoveryPhase,
};
use pgward_types::node::{NodeId, NodeProfile, NodeSnapshot, NodeState, LOCAL_NODE_ID};

use crate::fsm::cmdmgr::{ClusterCommand, CommandManager, CommandSource, SendTo};
use crate::fsm::escalation::EscalationManager;
use crate::fsm::event::Event;
use crate::fsm::ifmgr::{LinkEvent, LinkMonitor};
use crate::fsm::output::{Disconnect as _, Outbox, Wire};
use crate::fsm::peermgr::{self, wire_auth_hash, Connected, PeerManager};
use crate::fsm::votemgr::{self, ConsensusOutcome, FailoverManager};
use crate::fsm::{escalation, output};
use crate::net::{Clock, Link, LocalDuration, LocalTime};

/// Time to wait for replies from peers during the election steps.
pub const ELECTION_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// Deadline of the `RequestInfo` round when joining.
pub const REQUEST_INFO_TIMEOUT: LocalDuration = LocalDuration::from_secs(4);
/// Settle delay before initializing decides its path.
pub const SETTLE_TIMEOUT: LocalDuration = LocalDuration::from_secs(1);
/// Interval of the coordinator beacon.
pub const BEACON_INTERVAL: LocalDuration = LocalDuration::from_secs(10);
/// A standby that saw nothing from its coordinator for this long probes it.
pub const MASTER_PROBE_TIMEOUT: LocalDuration = BEACON_INTERVAL;
/// A standby that saw nothing for two beacon intervals rejoins the cluster.
pub const MASTER_LOST_TIMEOUT: LocalDuration = LocalDuration::from_secs(20);
/// How long a parked online-recovery reply may wait for a failover to end.
pub const RECOVERY_WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Reply deadline of replicated IPC commands.
pub const IPC_FORWARD_TIMEOUT: LocalDuration = LocalDuration::from_secs(10);

/// Disconnect reason.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// The connection never matched a configured peer.
    UnknownPeer,
    /// The authentication hash was missing or wrong.
    AuthFailed,
    /// An accepted connection did not send `AddNode` in time.
    HandshakeTimeout,
    /// The peer was declared lost; both links are torn down.
    PeerLost,
    /// The peer sent bytes that do not decode.
    InvalidFrame,
    /// We are shutting down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPeer => write!(f, "connection from an unknown node"),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::HandshakeTimeout => write!(f, "no add-node message received in time"),
            Self::PeerLost => write!(f, "node is lost"),
            Self::InvalidFrame => write!(f, "message decode error"),
            Self::Shutdown => write!(f, "shutting down"),
        }
    }
}

impl From<DisconnectReason> for crate::net::Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The local node's identity.
    pub local: NodeProfile,
    /// The remote peers.
    pub peers: Vec<peermgr::PeerConfig>,
    /// Shared cluster authentication key.
    pub auth_key: Option<String>,
    /// Consensus switches.
    pub consensus: votemgr::Config,
    /// Virtual IP escalation.
    pub escalation: escalation::Config,
    /// Exit fatally on a total network blackout. The alternative keeps the
    /// process alive and rejoins once an address reappears.
    pub exit_on_network_trouble: bool,
}

/// A command or request sent to the state machine from the outside.
pub enum Command {
    /// Liveness report from the lifecheck path.
    NodeStatusChange { node_id: NodeId, status: NodeStatus },
    /// Backend failover request; enters the consensus engine.
    Failover {
        kind: FailoverKind,
        node_ids: Vec<i32>,
        flags: u8,
        reply: chan::Sender<IpcResponse>,
    },
    /// Replicate an online recovery phase to every peer.
    OnlineRecovery {
        phase: RecoveryPhase,
        node_id: i32,
        reply: chan::Sender<IpcResponse>,
    },
    /// The middleware signals a failover executing locally.
    FailoverIndication {
        phase: FailoverPhase,
        primary_quarantined: bool,
    },
    /// Enumerate the cluster.
    GetNodesList { reply: chan::Sender<NodesListResponse> },
    /// Read one runtime variable.
    GetRuntimeVariable {
        name: RuntimeVariable,
        reply: chan::Sender<RuntimeValue>,
    },
    /// Fetch the coordinator's cluster view.
    GetMasterData { reply: chan::Sender<IpcResponse> },
    /// Graceful shutdown: inform the cluster and resign the VIP.
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeStatusChange { node_id, status } => {
                write!(f, "NodeStatusChange({}, {:?})", node_id, status)
            }
            Self::Failover { kind, node_ids, .. } => {
                write!(f, "Failover({}, {:?})", kind, node_ids)
            }
            Self::OnlineRecovery { phase, .. } => write!(f, "OnlineRecovery({:?})", phase),
            Self::FailoverIndication { phase, .. } => {
                write!(f, "FailoverIndication({:?})", phase)
            }
            Self::GetNodesList { .. } => write!(f, "GetNodesList"),
            Self::GetRuntimeVariable { name, .. } => write!(f, "GetRuntimeVariable({:?})", name),
            Self::GetMasterData { .. } => write!(f, "GetMasterData"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Who the cluster master is, as far as the local node knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMaster {
    Unknown,
    Local,
    Remote(NodeId),
}

/// The local node.
#[derive(Debug)]
pub struct LocalNode {
    pub profile: NodeProfile,
    /// Current election priority. Usually the configured one; lowered
    /// temporarily when resigning after a failed consensus.
    pub priority: i16,
    pub state: NodeState,
    pub startup_time: LocalTime,
    pub current_state_since: LocalTime,
    pub quorum_status: i32,
}

/// Internal state machine events, dispatched to the per-state handlers.
#[derive(Debug)]
pub(crate) enum StateEvent {
    /// The local node just entered its current state.
    Entered,
    /// The state deadline passed.
    Timeout,
    /// A packet arrived that no cross-cutting handler consumed.
    Packet { node: NodeId, pkt: Packet },
    /// A tracked cluster command completed.
    CommandFinished(ClusterCommand),
    /// A remote node became unreachable.
    RemoteLost(NodeId),
    /// The quorum status changed.
    QuorumChanged,
}

/// A parked online-recovery reply, answered when the local failover ends
/// or the wait expires.
#[derive(Debug, Clone, Copy)]
struct RecoveryWait {
    addr: SocketAddr,
    command_id: u32,
    expires_at: LocalTime,
}

/// The watchdog protocol state machine.
pub struct StateMachine<C: Clock> {
    pub config: Config,
    pub(crate) local: LocalNode,
    pub(crate) peers: PeerManager<Outbox, C>,
    pub(crate) commands: CommandManager<Outbox, C>,
    pub(crate) failovers: FailoverManager<C>,
    pub(crate) escalation: EscalationManager,
    ifmon: Box<dyn LinkMonitor + Send>,
    pub(crate) master: ClusterMaster,
    /// Standby ids, maintained by the coordinator.
    pub(crate) standbys: Vec<NodeId>,
    /// Deadline of the current local state, when one is armed.
    pub(crate) state_deadline: Option<LocalTime>,
    /// Next coordinator beacon.
    pub(crate) next_beacon: Option<LocalTime>,
    last_tick: LocalTime,
    /// A local failover is executing (between start and end indications).
    failover_in_progress: bool,
    /// An online recovery is running somewhere in the cluster.
    recovery_in_progress: bool,
    recovery_waits: Vec<RecoveryWait>,
    /// The middleware quarantined its primary backend.
    pub(crate) primary_quarantined: bool,
    pub(crate) clock: C,
    pub outbox: Outbox,
    shutting_down: bool,
}

impl<C: Clock> Iterator for StateMachine<C> {
    type Item = output::Io;

    fn next(&mut self) -> Option<output::Io> {
        self.outbox.next()
    }
}

impl<C: Clock> StateMachine<C> {
    /// Construct a new state machine instance.
    pub fn new(config: Config, ifmon: Box<dyn LinkMonitor + Send>, clock: C) -> Self {
        let now = clock.local_time();
        let outbox = Outbox::new();
        let peers = PeerManager::new(
            peermgr::Config {
                peers: config.peers.clone(),
                auth_key: config.auth_key.clone(),
            },
            outbox.clone(),
            clock.clone(),
        );
        let commands = CommandManager::new(outbox.clone(), clock.clone());
        let failovers = FailoverManager::new(config.consensus.clone(), clock.clone());
        let escalation = EscalationManager::new(config.escalation.clone());
        let local = LocalNode {
            profile: config.local.clone(),
            priority: config.local.priority,
            state: NodeState::Dead,
            startup_time: now,
            current_state_since: now,
            quorum_status: -1,
        };

        Self {
            config,
            local,
            peers,
            commands,
            failovers,
            escalation,
            ifmon,
            master: ClusterMaster::Unknown,
            standbys: Vec::new(),
            state_deadline: None,
            next_beacon: None,
            last_tick: now,
            failover_in_progress: false,
            recovery_in_progress: false,
            recovery_waits: Vec::new(),
            primary_quarantined: false,
            clock,
            outbox,
            shutting_down: false,
        }
    }

    /// The local node's current state.
    pub fn state(&self) -> NodeState {
        self.local.state
    }

    /// The cluster master, as far as the local node knows.
    pub fn master(&self) -> ClusterMaster {
        self.master
    }

    /// Whether the local node is the accepted cluster master.
    pub fn is_local_master(&self) -> bool {
        self.master == ClusterMaster::Local
    }

    /// The local quorum status.
    pub fn quorum_status(&self) -> i32 {
        self.local.quorum_status
    }

    /// Whether the local node holds the escalation.
    pub fn escalated(&self) -> bool {
        self.escalation.escalated
    }

    /// Immutable access to the peer table.
    pub fn peers(&self) -> &PeerManager<Outbox, C> {
        &self.peers
    }

    /// Initialize the state machine. Called once by the reactor.
    pub fn initialize(&mut self, _time: LocalTime) {
        self.outbox.push(Event::Initializing.into());

        if self.ifmon.addresses().is_empty() {
            self.fatal("no usable network interface at startup");
            return;
        }

        self.peers.initialize();
        self.set_state(NodeState::Loading);
    }

    /// An outbound connection attempt is underway.
    pub fn attempted(&mut self, addr: &SocketAddr) {
        self.peers.attempted(addr);
    }

    /// A connection with a peer was established.
    pub fn connected(&mut self, addr: SocketAddr, _local_addr: &SocketAddr, link: Link) {
        match self.peers.connected(addr, link) {
            Connected::Outbound(node) => self.new_outbound_connection(node),
            Connected::InboundPending => {
                // Wait for the `AddNode` before trusting the connection.
            }
            Connected::Unknown => {
                warn!(target: "wd", "{}: connection matches no configured peer", addr);
                self.outbox.disconnect(addr, DisconnectReason::UnknownPeer);
            }
        }
    }

    /// Ask the reactor to drop a connection.
    pub fn disconnect(&mut self, addr: SocketAddr, reason: DisconnectReason) {
        self.outbox.disconnect(addr, reason);
    }

    /// A peer connection went away.
    pub fn disconnected(
        &mut self,
        addr: &SocketAddr,
        reason: crate::net::Disconnect<DisconnectReason>,
    ) {
        debug!(target: "wd", "{}: connection closed: {}", addr, reason);

        if let Some(node) = self.peers.disconnected(addr) {
            self.remote_node_lost(node);
        }
    }

    /// A complete wire packet arrived.
    pub fn packet_received(&mut self, addr: &SocketAddr, pkt: Packet) {
        let Some(node) = self.peers.node_by_addr(addr) else {
            self.unidentified_packet(*addr, pkt);
            return;
        };

        debug!(
            target: "wd",
            "received {} (id {}) from node {}",
            pkt.ty, pkt.command_id, node
        );
        self.peers.packet_received(node);

        // Cross-cutting handlers run before the per-state dispatch.
        match pkt.ty {
            MessageType::Info => {
                self.process_info(node, &pkt);
                // An Info may also answer a tracked RequestInfo round.
                if self.commands.is_tracked(pkt.command_id) {
                    self.command_reply(node, &pkt);
                }
                // Once every add-node introduction was answered, loading is
                // done; no need to sit out the full window.
                if self.local.state == NodeState::Loading
                    && !self
                        .peers
                        .iter()
                        .any(|p| p.state == NodeState::AddMessageSent)
                {
                    self.set_state(NodeState::Initializing);
                }
                return;
            }
            MessageType::InformIamGoingDown => {
                if let Some(peer) = self.peers.get_mut(node) {
                    info!(target: "wd", "remote node \"{}\" is shutting down", peer.profile.name);
                    peer.state = NodeState::Shutdown;
                }
                self.remote_node_lost(node);
                return;
            }
            ty if ty.is_reply() => {
                if self.commands.is_tracked(pkt.command_id) {
                    self.command_reply(node, &pkt);
                    return;
                }
                // An unsolicited reply; let the per-state logic see it
                // (e.g. a `Reject` of our untracked AddNode).
            }
            _ => {}
        }

        self.dispatch(StateEvent::Packet { node, pkt });
    }

    /// Wall-clock driven duties: reaping, link monitoring, reply timeouts,
    /// command deadlines, quorum recomputation, proposal expiry, beacons.
    pub fn tick(&mut self) {
        let now = self.clock.local_time();

        if now - self.last_tick < LocalDuration::from_secs(1) {
            return;
        }
        self.last_tick = now;
        self.periodic(now);
    }

    /// A timer armed through the outbox expired.
    pub fn timer_expired(&mut self) {
        let now = self.clock.local_time();

        self.last_tick = now;
        self.periodic(now);
    }

    fn periodic(&mut self, now: LocalTime) {
        self.escalation.reap();

        for event in self.ifmon.poll() {
            self.network_event(event);
        }

        for node in self.peers.received_wake() {
            warn!(target: "wd", "node {} is not replying, marking lost", node);
            self.remote_node_lost(node);
        }

        for command in self.commands.sweep() {
            self.finish_command(command);
        }

        self.sweep_recovery_waits(now);

        if self.local.state == NodeState::Standby {
            self.standby_master_check();
        }

        if self.local.state == NodeState::Coordinator {
            self.update_quorum();
            self.expire_failovers();

            if self.next_beacon.map_or(false, |at| now >= at) {
                self.next_beacon = Some(now + BEACON_INTERVAL);
                self.send_beacon();
            }
        }

        if self.state_deadline.map_or(false, |at| now >= at) {
            self.state_deadline = None;
            self.dispatch(StateEvent::Timeout);
        }
    }

    /// Process an external command.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "wd", "received command: {:?}", cmd);

        match cmd {
            Command::NodeStatusChange { node_id, status } => {
                self.node_status_change(node_id, status)
            }
            Command::Failover {
                kind,
                node_ids,
                flags,
                reply,
            } => self.ipc_failover(kind, node_ids, flags, reply),
            Command::OnlineRecovery {
                phase,
                node_id,
                reply,
            } => self.ipc_online_recovery(phase, node_id, reply),
            Command::FailoverIndication {
                phase,
                primary_quarantined,
            } => self.failover_indication(phase, primary_quarantined),
            Command::GetNodesList { reply } => {
                reply.send(self.nodes_list()).ok();
            }
            Command::GetRuntimeVariable { name, reply } => {
                let value = match name {
                    RuntimeVariable::WdState => RuntimeValue::State(self.local.state),
                    RuntimeVariable::QuorumState => RuntimeValue::Int(match self.master {
                        ClusterMaster::Local => self.local.quorum_status as i64,
                        ClusterMaster::Remote(node) => self
                            .peers
                            .get(node)
                            .map(|p| p.quorum_status as i64)
                            .unwrap_or(-2),
                        ClusterMaster::Unknown => -2,
                    }),
                    RuntimeVariable::EscalationState => {
                        RuntimeValue::Bool(self.escalation.escalated)
                    }
                };
                reply.send(value).ok();
            }
            Command::GetMasterData { reply } => self.ipc_master_data(reply),
            Command::Shutdown => self.shutdown(),
        }
    }

    // Packet paths ////////////////////////////////////////////////////////

    /// A packet from a connection that has not been identified yet. Only
    /// `AddNode` is meaningful here.
    fn unidentified_packet(&mut self, addr: SocketAddr, pkt: Packet) {
        if pkt.ty != MessageType::AddNode {
            debug!(target: "wd", "{}: {} from unidentified connection", addr, pkt.ty);
            self.outbox.reject(addr, pkt.command_id);
            self.outbox.disconnect(addr, DisconnectReason::UnknownPeer);
            return;
        }

        let snapshot: NodeSnapshot = match pkt.json() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(target: "wd", "{}: invalid add-node message: {}", addr, err);
                self.outbox.reject(addr, pkt.command_id);
                self.outbox.disconnect(addr, DisconnectReason::InvalidFrame);
                return;
            }
        };

        match self.peers.identify(addr, &snapshot) {
            Ok(node) => {
                self.peers.update_from_snapshot(node, &snapshot);
                self.peers.packet_received(node);

                let reply = self.my_snapshot();
                self.outbox.info(addr, pkt.command_id, &reply);

                let name = snapshot.name.clone();
                self.outbox.push(Event::NodeFound { node, name }.into());
                self.commands.node_found(node, &mut self.peers);
            }
            Err(err) => {
                let reason = match err {
                    peermgr::IdentifyError::AuthFailed => DisconnectReason::AuthFailed,
                    peermgr::IdentifyError::UnknownNode => DisconnectReason::UnknownPeer,
                };
                self.outbox.reject(addr, pkt.command_id);
                self.outbox.disconnect(addr, reason);
            }
        }
    }

    /// Bookkeeping for every `Info` snapshot: peer table update, master
    /// tracking, split-brain detection, standby-departure detection.
    fn process_info(&mut self, node: NodeId, pkt: &Packet) {
        let snapshot: NodeSnapshot = match pkt.json() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(target: "wd", "node {} sent an invalid info message: {}", node, err);
                if let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) {
                    self.outbox.cluster_service(
                        addr,
                        pkt.command_id,
                        ClusterServiceCode::NodeInvalidVersion,
                    );
                }
                return;
            }
        };

        if !self.peers.verify_auth(&snapshot) {
            warn!(target: "wd", "node {} sent an info message failing authentication", node);
            return;
        }

        let Some((old_state, old_quorum)) = self.peers.update_from_snapshot(node, &snapshot)
        else {
            return;
        };

        if snapshot.state == NodeState::Coordinator {
            match self.master {
                ClusterMaster::Unknown => {
                    info!(target: "wd", "node \"{}\" is the cluster coordinator", snapshot.name);
                    self.master = ClusterMaster::Remote(node);
                }
                ClusterMaster::Remote(master) if master == node => {
                    if old_quorum != snapshot.quorum_status {
                        self.outbox.push(
                            Event::QuorumChanged {
                                status: snapshot.quorum_status,
                            }
                            .into(),
                        );
                    }
                }
                ClusterMaster::Remote(_) => {
                    // Somebody else claims the coordinatorship; this fight
                    // is not ours to pick.
                    warn!(
                        target: "wd",
                        "node \"{}\" also announces as coordinator, cluster is in split-brain",
                        snapshot.name,
                    );
                    self.outbox.push(Event::SplitBrainDetected { node }.into());
                    self.broadcast_cluster_service(ClusterServiceCode::InSplitBrain);
                }
                ClusterMaster::Local => {
                    warn!(
                        target: "wd",
                        "we are the coordinator but node \"{}\" also announces as one",
                        snapshot.name,
                    );
                    self.outbox.push(Event::SplitBrainDetected { node }.into());
                    self.handle_split_brain(node);
                }
            }
        } else if self.master == ClusterMaster::Remote(node) {
            warn!(
                target: "wd",
                "the coordinator as per our record is not coordinator anymore, re-joining",
            );
            self.set_state(NodeState::Joining);
        }

        // A standby that silently left the cluster view.
        if old_state == NodeState::Standby
            && snapshot.state != NodeState::Standby
            && self.local.state == NodeState::Coordinator
        {
            self.standby_left(node);
        }
    }

    /// Correlate a reply with its tracked command.
    fn command_reply(&mut self, node: NodeId, pkt: &Packet) {
        if let Some(finished) = self.commands.reply_received(node, pkt) {
            self.finish_command(finished);
        }
    }

    /// Shared packet semantics, called from the per-state handlers for
    /// everything they do not treat specially.
    pub(crate) fn standard_packet(&mut self, node: NodeId, pkt: &Packet) {
        let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) else {
            return;
        };

        match pkt.ty {
            MessageType::AddNode | MessageType::RequestInfo => {
                let snapshot = self.my_snapshot();
                self.outbox.info(addr, pkt.command_id, &snapshot);
            }
            MessageType::JoinCoordinator => {
                if self.master == ClusterMaster::Local {
                    self.outbox.accept(addr, pkt.command_id);
                    self.standby_joined(node);
                    let id = self.commands.next_command_id();
                    self.outbox
                        .minimal(addr, MessageType::AskForPoolConfig, id);
                } else {
                    self.outbox.reject(addr, pkt.command_id);
                }
            }
            MessageType::IAmCoordinator => {
                self.beacon_received(node, pkt);
            }
            MessageType::FailoverRequest => {
                self.remote_failover_request(node, pkt);
            }
            MessageType::FailoverWaitingForConsensus => {
                info!(
                    target: "wd",
                    "node {} asks for failover requests for quarantined backends", node
                );
                self.outbox.push(Event::InformQuarantinedNodes.into());
            }
            MessageType::FailoverStart => {
                if self.master == ClusterMaster::Remote(node) {
                    debug!(target: "wd", "coordinator started a failover");
                }
            }
            MessageType::FailoverEnd => {
                if self.master == ClusterMaster::Remote(node) {
                    self.outbox.push(Event::SyncBackendStates.into());
                }
            }
            MessageType::ClusterService => match pkt.service_code() {
                Some(code) => self.cluster_service_message(node, code),
                None => {
                    warn!(target: "wd", "node {} sent an invalid cluster service message", node)
                }
            },
            MessageType::AskForPoolConfig => {
                let payload = self.pool_config();
                self.outbox.message(
                    addr,
                    Packet::with_json(MessageType::PoolConfigData, pkt.command_id, &payload),
                );
            }
            MessageType::PoolConfigData => {
                if self.local.state == NodeState::Coordinator {
                    self.verify_pool_config(node, pkt);
                }
            }
            MessageType::Data => {
                self.data_request(node, pkt);
            }
            MessageType::IamInNwTrouble => {
                info!(target: "wd", "node {} reports a network blackout on its side", node);
            }
            MessageType::QuorumIsLost => {
                info!(target: "wd", "node {} reports it has lost the quorum", node);
            }
            _ => {
                debug!(target: "wd", "ignoring {} from node {}", pkt.ty, node);
            }
        }
    }

    /// Handle a cluster service sub-code.
    fn cluster_service_message(&mut self, node: NodeId, code: ClusterServiceCode) {
        match code {
            ClusterServiceCode::IamTrueMaster => {
                if self.local.state == NodeState::Coordinator {
                    warn!(
                        target: "wd",
                        "node {} decided it is the true coordinator, stepping down", node
                    );
                    self.broadcast_cluster_service(ClusterServiceCode::IamResigningFromMaster);
                    self.set_state(NodeState::Joining);
                } else if matches!(self.master, ClusterMaster::Remote(m) if m != node) {
                    warn!(
                        target: "wd",
                        "node {} claims mastership against our recorded coordinator", node
                    );
                    self.broadcast_cluster_service(ClusterServiceCode::NeedsElection);
                    self.set_state(NodeState::Joining);
                }
            }
            ClusterServiceCode::IamNotTrueMaster | ClusterServiceCode::IamResigningFromMaster => {
                if self.master == ClusterMaster::Remote(node) {
                    info!(
                        target: "wd",
                        "coordinator node {} resigned, re-initializing the cluster", node
                    );
                    self.set_state(NodeState::Joining);
                } else {
                    debug!(target: "wd", "node {} resigned but was not our coordinator", node);
                }
            }
            ClusterServiceCode::InSplitBrain => {
                self.retry_unreachable_peers();
                if self.local.state == NodeState::Coordinator {
                    info!(
                        target: "wd",
                        "node {} reports a split-brain, re-broadcasting the beacon", node
                    );
                    self.send_beacon();
                }
            }
            ClusterServiceCode::NeedsElection => {
                info!(target: "wd", "node {} wants a new election", node);
                self.set_state(NodeState::Joining);
            }
            ClusterServiceCode::QuorumLost | ClusterServiceCode::QuorumFound => {
                debug!(target: "wd", "node {} reported quorum change: {}", node, code);
            }
            ClusterServiceCode::NodeInvalidVersion => {
                warn!(
                    target: "wd",
                    "node {} could not parse our messages; check cluster versions", node
                );
            }
        }
    }

    /// Process a coordinator beacon.
    fn beacon_received(&mut self, node: NodeId, pkt: &Packet) {
        let beacon: Option<BeaconPayload> = pkt.json().ok();

        if let Some(beacon) = &beacon {
            let now = self.clock.local_time();

            if let Some(peer) = self.peers.get_mut(node) {
                peer.state = beacon.state;
                peer.startup_time = now - LocalDuration::from_secs(beacon.seconds_since_startup);
                peer.current_state_since =
                    now - LocalDuration::from_secs(beacon.seconds_since_state_change);
                peer.quorum_status = beacon.quorum_status;
                peer.standby_count = beacon.standby_count;
                peer.escalated = beacon.escalated;
                peer.beacon_seen = true;
            }
        }

        match self.master {
            ClusterMaster::Local => {
                // Two coordinators: the split-brain tiebreak decides.
                warn!(target: "wd", "beacon from node {} while we are coordinator", node);
                self.outbox.push(Event::SplitBrainDetected { node }.into());

                if beacon.is_some() {
                    self.handle_split_brain(node);
                } else {
                    // An empty beacon leaves the tiebreak undecidable.
                    warn!(
                        target: "wd",
                        "split-brain with node {} cannot be arbitrated, forcing an election",
                        node,
                    );
                    self.broadcast_cluster_service(ClusterServiceCode::NeedsElection);
                    self.set_state(NodeState::Joining);
                }
            }
            ClusterMaster::Remote(master) if master == node => {
                // Answer the heartbeat with our snapshot.
                if let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) {
                    let snapshot = self.my_snapshot();
                    self.outbox.info(addr, pkt.command_id, &snapshot);
                }
            }
            ClusterMaster::Remote(_) => {
                warn!(
                    target: "wd",
                    "beacon from node {} but another node is our coordinator", node
                );
                self.broadcast_cluster_service(ClusterServiceCode::InSplitBrain);
            }
            ClusterMaster::Unknown => {
                self.master = ClusterMaster::Remote(node);
                if let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) {
                    let snapshot = self.my_snapshot();
                    self.outbox.info(addr, pkt.command_id, &snapshot);
                }
            }
        }
    }

    /// A `Data` request from a peer.
    fn data_request(&mut self, node: NodeId, pkt: &Packet) {
        let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) else {
            return;
        };
        let request: DataRequest = match pkt.json() {
            Ok(request) => request,
            Err(_) => {
                self.outbox.error(addr, pkt.command_id);
                return;
            }
        };

        match request {
            DataRequest::MasterData => {
                if self.local.state == NodeState::Coordinator {
                    let body = self.master_data();
                    self.outbox.message(
                        addr,
                        Packet::with_json(MessageType::CmdReplyInData, pkt.command_id, &body),
                    );
                } else {
                    self.outbox.error(addr, pkt.command_id);
                }
            }
            DataRequest::OnlineRecovery { phase, .. } => {
                self.remote_recovery_request(addr, pkt.command_id, phase)
            }
        }
    }

    /// A replicated online-recovery phase change from a peer.
    fn remote_recovery_request(&mut self, addr: SocketAddr, command_id: u32, phase: RecoveryPhase) {
        match phase {
            RecoveryPhase::Start => {
                if self.recovery_in_progress {
                    self.outbox.reject(addr, command_id);
                } else if self.failover_in_progress {
                    // Cannot accept while a failover is executing; park the
                    // reply and answer when it ends (or the wait expires).
                    let expires_at = self.clock.local_time() + RECOVERY_WAIT_TIMEOUT;
                    self.recovery_waits.push(RecoveryWait {
                        addr,
                        command_id,
                        expires_at,
                    });
                } else {
                    self.recovery_in_progress = true;
                    self.outbox.accept(addr, command_id);
                }
            }
            RecoveryPhase::End => {
                self.recovery_in_progress = false;
                self.outbox.accept(addr, command_id);
            }
        }
    }

    fn sweep_recovery_waits(&mut self, now: LocalTime) {
        let mut index = 0;

        while index < self.recovery_waits.len() {
            let wait = self.recovery_waits[index];

            if !self.failover_in_progress && !self.recovery_in_progress {
                self.recovery_in_progress = true;
                self.outbox.accept(wait.addr, wait.command_id);
                self.recovery_waits.remove(index);
                continue;
            }
            if now >= wait.expires_at {
                self.outbox.reject(wait.addr, wait.command_id);
                self.recovery_waits.remove(index);
                continue;
            }
            index += 1;
        }
    }

    /// A replicated failover vote from a peer. Only the coordinator
    /// arbitrates; everyone else answers `Error`.
    fn remote_failover_request(&mut self, node: NodeId, pkt: &Packet) {
        let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) else {
            return;
        };

        if self.local.state != NodeState::Coordinator {
            self.outbox.error(addr, pkt.command_id);
            return;
        }

        let request: pgward_types::messages::FailoverRequestPayload = match pkt.json() {
            Ok(request) => request,
            Err(err) => {
                warn!(target: "wd", "node {} sent an invalid failover request: {}", node, err);
                self.outbox.error(addr, pkt.command_id);
                return;
            }
        };

        info!(
            target: "wd",
            "processing {} failover request from node {}", request.kind, node
        );
        let result =
            self.failover_consensus(request.kind, &request.node_ids, request.flags, node, true);

        self.outbox.message(
            addr,
            Packet::with_json(
                MessageType::CmdReplyInData,
                pkt.command_id,
                &FailoverIpcResponse { result },
            ),
        );
    }

    // Consensus ///////////////////////////////////////////////////////////

    /// Run one failover vote through the consensus engine and perform the
    /// coordinator-side effects of the outcome.
    ///
    /// `remote` is true when the vote came over the wire; consensus then
    /// ends in the local middleware executing the failover on the cluster's
    /// behalf.
    pub(crate) fn failover_consensus(
        &mut self,
        kind: FailoverKind,
        node_ids: &[i32],
        flags: u8,
        requestor: NodeId,
        remote: bool,
    ) -> FailoverResult {
        self.update_quorum();

        let outcome = self.failovers.compute_consensus(
            kind,
            node_ids,
            flags,
            requestor,
            self.local.quorum_status,
            self.peers.remote_count(),
        );

        match outcome {
            ConsensusOutcome::Proceed { flags } => {
                if remote {
                    self.outbox.push(
                        Event::ExecuteFailover {
                            kind,
                            node_ids: node_ids.to_vec(),
                            flags: flags | request_flags::WATCHDOG,
                        }
                        .into(),
                    );
                    FailoverResult::WillBeDone
                } else {
                    FailoverResult::Proceed
                }
            }
            ConsensusOutcome::NoQuorum => FailoverResult::NoQuorum,
            ConsensusOutcome::BuildingConsensus => {
                // Ask every node to re-send failover requests for backends
                // they have quarantined.
                self.broadcast_message(MessageType::FailoverWaitingForConsensus, None);
                if remote {
                    self.outbox.push(Event::InformQuarantinedNodes.into());
                }
                FailoverResult::BuildingConsensus
            }
            ConsensusOutcome::ConsensusMayFail => FailoverResult::ConsensusMayFail,
        }
    }

    /// Expire stale proposals; resign the coordinatorship when we voted to
    /// fail over a primary the middleware has quarantined and the cluster
    /// would not follow.
    fn expire_failovers(&mut self) {
        let expired = self.failovers.expire();
        let need_resign = self.primary_quarantined
            && expired
                .iter()
                .any(|p| p.kind == FailoverKind::NodeDown && p.has_local_vote());

        if need_resign {
            warn!(
                target: "wd",
                "could not build consensus for our primary failover request, resigning",
            );
            self.local.priority = -1;
            self.broadcast_cluster_service(ClusterServiceCode::IamResigningFromMaster);
            self.set_state(NodeState::Joining);
        }
    }

    // IPC commands ////////////////////////////////////////////////////////

    fn ipc_failover(
        &mut self,
        kind: FailoverKind,
        node_ids: Vec<i32>,
        flags: u8,
        reply: chan::Sender<IpcResponse>,
    ) {
        match self.local.state {
            NodeState::Coordinator => {
                let result = self.failover_consensus(kind, &node_ids, flags, LOCAL_NODE_ID, false);
                reply
                    .send(IpcResponse::ok(&FailoverIpcResponse { result }))
                    .ok();
            }
            NodeState::Standby => {
                let ClusterMaster::Remote(master) = self.master else {
                    reply.send(IpcResponse::in_transition()).ok();
                    return;
                };
                let id = self.commands.next_command_id();
                let packet = Packet::with_json(
                    MessageType::FailoverRequest,
                    id,
                    &pgward_types::messages::FailoverRequestPayload {
                        kind,
                        node_ids,
                        flags,
                    },
                );

                info!(target: "wd", "forwarding failover request to coordinator node {}", master);
                if let Some(finished) = self.commands.submit(
                    packet,
                    CommandSource::Ipc {
                        ty: IpcCommandType::FailoverCommand,
                        reply,
                    },
                    SendTo::Node(master),
                    IPC_FORWARD_TIMEOUT,
                    &mut self.peers,
                ) {
                    self.finish_command(finished);
                }
            }
            _ => {
                reply.send(IpcResponse::in_transition()).ok();
            }
        }
    }

    fn ipc_online_recovery(
        &mut self,
        phase: RecoveryPhase,
        node_id: i32,
        reply: chan::Sender<IpcResponse>,
    ) {
        if !matches!(
            self.local.state,
            NodeState::Coordinator | NodeState::Standby
        ) {
            reply.send(IpcResponse::in_transition()).ok();
            return;
        }

        self.recovery_in_progress = phase == RecoveryPhase::Start;

        if self.peers.active_count() == 0 {
            reply.send(IpcResponse::ok(&serde_json::json!({}))).ok();
            return;
        }

        let id = self.commands.next_command_id();
        let packet = Packet::with_json(
            MessageType::Data,
            id,
            &DataRequest::OnlineRecovery { phase, node_id },
        );

        if let Some(finished) = self.commands.submit(
            packet,
            CommandSource::Ipc {
                ty: IpcCommandType::OnlineRecoveryCommand,
                reply,
            },
            SendTo::All,
            IPC_FORWARD_TIMEOUT,
            &mut self.peers,
        ) {
            self.finish_command(finished);
        }
    }

    fn failover_indication(&mut self, phase: FailoverPhase, primary_quarantined: bool) {
        self.primary_quarantined = primary_quarantined;

        match phase {
            FailoverPhase::Start => {
                self.failover_in_progress = true;
                if self.local.state == NodeState::Coordinator {
                    self.broadcast_message(MessageType::FailoverStart, None);
                }
            }
            FailoverPhase::End => {
                self.failover_in_progress = false;
                if self.local.state == NodeState::Coordinator {
                    self.broadcast_message(MessageType::FailoverEnd, None);
                }
            }
        }
    }

    fn ipc_master_data(&mut self, reply: chan::Sender<IpcResponse>) {
        match self.local.state {
            NodeState::Coordinator => {
                let body = self.master_data();
                reply.send(IpcResponse::ok(&body)).ok();
            }
            NodeState::Standby => {
                let ClusterMaster::Remote(master) = self.master else {
                    reply.send(IpcResponse::in_transition()).ok();
                    return;
                };
                let id = self.commands.next_command_id();
                let packet = Packet::with_json(MessageType::Data, id, &DataRequest::MasterData);

                if let Some(finished) = self.commands.submit(
                    packet,
                    CommandSource::Ipc {
                        ty: IpcCommandType::GetMasterData,
                        reply,
                    },
                    SendTo::Node(master),
                    IPC_FORWARD_TIMEOUT,
                    &mut self.peers,
                ) {
                    self.finish_command(finished);
                }
            }
            _ => {
                reply.send(IpcResponse::in_transition()).ok();
            }
        }
    }

    fn node_status_change(&mut self, node_id: NodeId, status: NodeStatus) {
        if node_id == LOCAL_NODE_ID {
            match status {
                NodeStatus::Dead => {
                    warn!(
                        target: "wd",
                        "lifecheck reports we are disconnected from the network",
                    );
                    self.set_state(NodeState::Lost);
                }
                NodeStatus::Alive => {
                    debug!(target: "wd", "lifecheck reports the local node alive");
                }
            }
            return;
        }

        match status {
            NodeStatus::Dead => {
                if self.peers.get(node_id).is_some() {
                    self.remote_node_lost(node_id);
                }
            }
            NodeStatus::Alive => self.remote_node_found(node_id),
        }
    }

    fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        info!(target: "wd", "shutting down, informing the cluster");
        self.broadcast_message(MessageType::InformIamGoingDown, None);
        if self.escalation.escalated {
            self.escalation.de_escalate();
            self.outbox
                .push(Event::EscalationChanged { escalated: false }.into());
        }
    }

    // Node loss and recovery //////////////////////////////////////////////

    /// Both links to a node are gone (or it stopped replying).
    pub(crate) fn remote_node_lost(&mut self, node: NodeId) {
        let Some(peer) = self.peers.get(node) else {
            return;
        };
        let name = peer.profile.name.clone();
        let was_active = peer.is_active();

        self.peers.mark_lost(node);

        if !was_active {
            return;
        }
        info!(target: "wd", "remote node \"{}\" is lost", name);

        if self.master == ClusterMaster::Remote(node) {
            warn!(target: "wd", "the cluster has lost its coordinator node");
            self.master = ClusterMaster::Unknown;
        }

        for command in self.commands.node_lost(node) {
            self.finish_command(command);
        }

        self.outbox.push(Event::NodeLost { node, name }.into());
        self.dispatch(StateEvent::RemoteLost(node));
    }

    /// The lifecheck (or a fresh connection) reports a node alive again.
    fn remote_node_found(&mut self, node: NodeId) {
        let Some(peer) = self.peers.get(node) else {
            return;
        };
        let name = peer.profile.name.clone();

        info!(target: "wd", "remote node \"{}\" became reachable again", name);
        if let Some(addr) = peer.send_addr() {
            let id = self.commands.next_command_id();
            self.outbox.minimal(addr, MessageType::RequestInfo, id);
        }
        self.commands.node_found(node, &mut self.peers);
        self.outbox.push(Event::NodeFound { node, name }.into());
    }

    /// A dialed connection to a peer completed.
    fn new_outbound_connection(&mut self, node: NodeId) {
        let Some(peer) = self.peers.get_mut(node) else {
            return;
        };

        if peer.state == NodeState::Dead {
            peer.state = NodeState::AddMessageSent;
        }
        let addr = peer.addr;
        let id = self.commands.next_command_id();
        let snapshot = self.my_snapshot();

        self.outbox
            .message(addr, Packet::with_json(MessageType::AddNode, id, &snapshot));
        self.commands.node_found(node, &mut self.peers);
    }

    // Cluster bookkeeping /////////////////////////////////////////////////

    /// A standby was admitted by the local coordinator.
    pub(crate) fn standby_joined(&mut self, node: NodeId) {
        if !self.standbys.contains(&node) {
            if let Some(peer) = self.peers.get(node) {
                info!(
                    target: "wd",
                    "node \"{}\" joined the cluster as standby", peer.profile.name
                );
            }
            self.standbys.push(node);
        }
        self.update_quorum();
    }

    /// A standby left the local coordinator's cluster.
    pub(crate) fn standby_left(&mut self, node: NodeId) {
        if let Some(index) = self.standbys.iter().position(|n| *n == node) {
            self.standbys.remove(index);
            if let Some(peer) = self.peers.get(node) {
                info!(
                    target: "wd",
                    "node \"{}\" left the standby list", peer.profile.name
                );
            }
        }
        self.update_quorum();
    }

    /// Recompute the quorum from the standby count; fires the quorum-change
    /// path on transitions. Coordinator only.
    pub(crate) fn update_quorum(&mut self) {
        if self.local.state != NodeState::Coordinator {
            return;
        }

        let status = votemgr::quorum_status(
            self.standbys.len() as u32,
            self.peers.remote_count(),
            self.config.consensus.enable_consensus_with_half_votes,
        );

        if status != self.local.quorum_status {
            info!(
                target: "wd",
                "quorum status changed from {} to {}", self.local.quorum_status, status
            );
            self.local.quorum_status = status;
            self.dispatch(StateEvent::QuorumChanged);
        }
    }

    /// Dial every unreachable peer again, ignoring the backoff. Used when
    /// recovering from split-brain or network trouble.
    pub(crate) fn retry_unreachable_peers(&mut self) {
        let addrs: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|p| !p.is_reachable())
            .map(|p| p.addr)
            .collect();

        for addr in addrs {
            self.peers.attempted(&addr);
            self.outbox.push(output::Io::Connect(addr));
        }
    }

    // Command completion //////////////////////////////////////////////////

    /// Route a completed cluster command.
    pub(crate) fn finish_command(&mut self, command: ClusterCommand) {
        use crate::fsm::cmdmgr::CommandStatus;

        if matches!(command.source, CommandSource::Local) {
            self.dispatch(StateEvent::CommandFinished(command));
            return;
        }

        let status = command.status;
        let reply_data = command.reply_data;

        match command.source {
            CommandSource::Ipc { ty, reply } => {
                let response = match status {
                    CommandStatus::AllReplied => match ty {
                        IpcCommandType::FailoverCommand | IpcCommandType::GetMasterData => {
                            match reply_data
                                .as_deref()
                                .and_then(|data| serde_json::from_slice(data).ok())
                            {
                                Some(body) => IpcResponse {
                                    ty: pgward_types::ipc::IpcResultType::Ok,
                                    body,
                                },
                                None => IpcResponse::bad("coordinator reply could not be parsed"),
                            }
                        }
                        _ => IpcResponse::ok(&serde_json::json!({})),
                    },
                    CommandStatus::Timeout => IpcResponse::timeout(),
                    CommandStatus::NodeRejected => IpcResponse::bad("request rejected by a node"),
                    CommandStatus::SendFailed => {
                        IpcResponse::bad("request could not be delivered to any node")
                    }
                    CommandStatus::InProgress => return,
                };
                reply.send(response).ok();
            }
            CommandSource::Remote { node, command_id } => {
                // No remote-sourced commands are tracked today; answer with
                // an error so the peer is not left waiting.
                if let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) {
                    self.outbox.error(addr, command_id);
                }
            }
            CommandSource::Local => unreachable!("handled above"),
        }
    }

    // Messaging helpers ///////////////////////////////////////////////////

    /// Send an untracked message to every active, reachable peer.
    pub(crate) fn broadcast_message(&mut self, ty: MessageType, payload: Option<Vec<u8>>) {
        let id = self.commands.next_command_id();
        let packet = Packet {
            ty,
            command_id: id,
            payload: payload.unwrap_or_default(),
        };
        let addrs: Vec<SocketAddr> = self.peers.active().filter_map(|p| p.send_addr()).collect();

        for addr in addrs {
            self.outbox.message(addr, packet.clone());
        }
    }

    /// Broadcast a cluster service sub-code.
    pub(crate) fn broadcast_cluster_service(&mut self, code: ClusterServiceCode) {
        self.broadcast_message(MessageType::ClusterService, Some(vec![code.to_byte()]));
    }

    /// Broadcast our `Info` snapshot.
    pub(crate) fn broadcast_info(&mut self) {
        let snapshot = self.my_snapshot();
        self.broadcast_message(
            MessageType::Info,
            Some(serde_json::to_vec(&snapshot).expect("snapshot always serializes")),
        );
    }

    /// Send the coordinator beacon as a tracked cluster command.
    pub(crate) fn send_beacon(&mut self) {
        let beacon = self.my_beacon();
        let id = self.commands.next_command_id();
        let packet = Packet::with_json(MessageType::IAmCoordinator, id, &beacon);

        if let Some(finished) = self.commands.submit(
            packet,
            CommandSource::Local,
            SendTo::All,
            ELECTION_TIMEOUT,
            &mut self.peers,
        ) {
            self.finish_command(finished);
        }
    }

    /// Our `Info` snapshot.
    pub(crate) fn my_snapshot(&self) -> NodeSnapshot {
        let now = self.clock.local_time();
        let auth_hash = self
            .config
            .auth_key
            .as_deref()
            .map(|key| wire_auth_hash(key, self.local.state, self.local.profile.wd_port));

        NodeSnapshot {
            name: self.local.profile.name.clone(),
            host: self.local.profile.host.clone(),
            wd_port: self.local.profile.wd_port,
            app_port: self.local.profile.app_port,
            priority: self.local.priority,
            state: self.local.state,
            seconds_since_startup: (now - self.local.startup_time).as_secs(),
            seconds_since_state_change: (now - self.local.current_state_since).as_secs(),
            quorum_status: self.local.quorum_status,
            standby_count: self.standbys.len() as u32,
            escalated: self.escalation.escalated,
            delegate_ip: self.config.escalation.delegate_ip.clone(),
            auth_hash,
        }
    }

    /// Our beacon payload.
    fn my_beacon(&self) -> BeaconPayload {
        let now = self.clock.local_time();

        BeaconPayload {
            state: self.local.state,
            seconds_since_startup: (now - self.local.startup_time).as_secs(),
            seconds_since_state_change: (now - self.local.current_state_since).as_secs(),
            quorum_status: self.local.quorum_status,
            standby_count: self.standbys.len() as u32,
            escalated: self.escalation.escalated,
        }
    }

    /// Our consensus-relevant configuration, exchanged with joining
    /// standbys.
    fn pool_config(&self) -> PoolConfigPayload {
        PoolConfigPayload {
            node_count: self.peers.remote_count() + 1,
            require_quorum: self.config.consensus.require_quorum,
            require_consensus: self.config.consensus.require_consensus,
            enable_consensus_with_half_votes: self.config.consensus.enable_consensus_with_half_votes,
            allow_multiple_failover_requests_from_node: self
                .config
                .consensus
                .allow_multiple_failover_requests_from_node,
        }
    }

    /// Compare a standby's configuration dump against ours, logging every
    /// mismatch. Nothing is enforced.
    fn verify_pool_config(&mut self, node: NodeId, pkt: &Packet) {
        let Ok(theirs) = pkt.json::<PoolConfigPayload>() else {
            warn!(target: "wd", "node {} sent an unparsable configuration dump", node);
            return;
        };
        let ours = self.pool_config();

        if theirs.node_count != ours.node_count {
            warn!(
                target: "wd",
                "node {} is configured with {} nodes, we have {}",
                node, theirs.node_count, ours.node_count
            );
        }
        if theirs.require_quorum != ours.require_quorum
            || theirs.require_consensus != ours.require_consensus
            || theirs.enable_consensus_with_half_votes != ours.enable_consensus_with_half_votes
            || theirs.allow_multiple_failover_requests_from_node
                != ours.allow_multiple_failover_requests_from_node
        {
            warn!(
                target: "wd",
                "node {} runs with different consensus settings than ours", node
            );
        }
    }

    /// The coordinator's cluster view, served over `GetMasterData`.
    fn master_data(&self) -> serde_json::Value {
        let standbys: Vec<&str> = self
            .standbys
            .iter()
            .filter_map(|id| self.peers.get(*id))
            .map(|p| p.profile.name.as_str())
            .collect();

        serde_json::json!({
            "Master": self.local.profile.name,
            "Standbys": standbys,
            "StandbyCount": self.standbys.len(),
            "QuorumStatus": self.local.quorum_status,
            "HoldingVip": self.escalation.holding_vip,
        })
    }

    /// The IPC nodes-list reply.
    fn nodes_list(&self) -> NodesListResponse {
        let mut nodes = Vec::with_capacity(self.peers.remote_count() as usize + 1);

        nodes.push(NodesListEntry {
            id: LOCAL_NODE_ID,
            name: self.local.profile.name.clone(),
            host: self.local.profile.host.clone(),
            wd_port: self.local.profile.wd_port,
            app_port: self.local.profile.app_port,
            priority: self.local.priority,
            state: self.local.state,
            state_name: self.local.state.to_string(),
            delegate_ip: self.config.escalation.delegate_ip.clone(),
        });
        for peer in self.peers.iter() {
            nodes.push(NodesListEntry {
                id: peer.id,
                name: peer.profile.name.clone(),
                host: peer.profile.host.clone(),
                wd_port: peer.profile.wd_port,
                app_port: peer.profile.app_port,
                priority: peer.profile.priority,
                state: peer.state,
                state_name: peer.state.to_string(),
                delegate_ip: peer.profile.delegate_ip.clone(),
            });
        }

        NodesListResponse {
            node_count: nodes.len() as u32,
            nodes,
        }
    }

    /// Network link and address changes from the interface monitor.
    fn network_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::IpRemoved(addr) => {
                info!(target: "wd", "ip address {} was removed", addr);
                self.address_lost();
            }
            LinkEvent::LinkDown(name) => {
                warn!(target: "wd", "network link {} went down", name);
                if !self.ifmon.has_active_link() {
                    warn!(target: "wd", "all monitored network links are down");
                    self.set_state(NodeState::InNetworkTrouble);
                } else {
                    self.address_lost();
                }
            }
            LinkEvent::IpAdded(addr) => {
                debug!(target: "wd", "ip address {} was assigned", addr);
                if matches!(
                    self.local.state,
                    NodeState::InNetworkTrouble | NodeState::Lost
                ) {
                    self.network_recovered();
                }
            }
            LinkEvent::LinkUp(name) => {
                debug!(target: "wd", "network link {} is up", name);
            }
        }
    }

    /// An address disappeared; decide between VIP re-acquisition and
    /// network trouble.
    fn address_lost(&mut self) {
        let addresses = self.ifmon.addresses();

        if addresses.is_empty() {
            warn!(target: "wd", "system has no ip address assigned");
            self.set_state(NodeState::InNetworkTrouble);
            return;
        }

        if self.local.state == NodeState::Coordinator && self.escalation.holding_vip {
            let vip: Option<std::net::IpAddr> =
                self.config.escalation.delegate_ip.parse().ok();

            if vip.map_or(false, |vip| !addresses.contains(&vip)) {
                self.escalation.reacquire();
            }
        }
    }

    /// The network came back after a blackout.
    pub(crate) fn network_recovered(&mut self) {
        if self.ifmon.addresses().is_empty() {
            return;
        }
        info!(target: "wd", "network is back, re-initializing the cluster state");

        self.broadcast_message(MessageType::IamInNwTrouble, None);
        self.retry_unreachable_peers();
        self.set_state(NodeState::Loading);
    }

    /// Give up: the invariant cannot hold.
    pub(crate) fn fatal(&mut self, reason: &str) {
        self.outbox.push(
            Event::Fatal {
                reason: reason.to_string(),
            }
            .into(),
        );
        self.shutting_down = true;
    }
}
