//! The election protocol: per-state handlers of the watchdog state
//! machine and the split-brain arbitration.
//!
//! Elections run on node priority, higher wins; ties break toward the
//! older `startup_time`. Two simultaneous coordinators are resolved by the
//! worthiness tiebreak in [`StateMachine::split_brain_decision`].

use tracing::{debug, info, warn};

use pgward_types::messages::{ClusterServiceCode, MessageType, Packet};
use pgward_types::node::{NodeId, NodeState};

use crate::fsm::cmdmgr::{ClusterCommand, CommandSource, CommandStatus, SendTo};
use crate::fsm::event::Event;
use crate::fsm::handler::{
    ClusterMaster, StateEvent, StateMachine, ELECTION_TIMEOUT, BEACON_INTERVAL,
    MASTER_LOST_TIMEOUT, MASTER_PROBE_TIMEOUT, REQUEST_INFO_TIMEOUT, SETTLE_TIMEOUT,
};
use crate::fsm::output::{SetTimer, Wire};
use crate::net::{Clock, LocalDuration};

/// Wait before re-checking the network while in trouble.
const NETWORK_RETRY_TIMEOUT: LocalDuration = LocalDuration::from_secs(2);

impl<C: Clock> StateMachine<C> {
    /// Transition the local node, running the exit and entry effects and
    /// announcing the new state to the cluster.
    pub(crate) fn set_state(&mut self, new: NodeState) {
        let old = self.local.state;

        if old == new {
            return;
        }
        self.local.state = new;
        self.local.current_state_since = self.clock.local_time();
        self.state_deadline = None;

        // Leaving the coordinatorship releases everything it owned.
        if old == NodeState::Coordinator {
            if self.escalation.escalated {
                self.escalation.de_escalate();
                self.outbox
                    .push(Event::EscalationChanged { escalated: false }.into());
            }
            self.standbys.clear();
            self.failovers.clear();
            self.next_beacon = None;
            if self.master == ClusterMaster::Local {
                self.master = ClusterMaster::Unknown;
            }
        }

        info!(
            target: "wd",
            "watchdog node state changed from [{}] to [{}]", old, new
        );
        self.outbox.push(Event::StateChanged { old, new }.into());

        self.dispatch(StateEvent::Entered);
        self.broadcast_info();
    }

    /// Dispatch an event to the handler of the current local state.
    pub(crate) fn dispatch(&mut self, event: StateEvent) {
        debug!(
            target: "wd",
            "state machine invoked with event {:?} in state [{}]", event, self.local.state
        );

        match self.local.state {
            NodeState::Loading => self.st_loading(event),
            NodeState::Joining => self.st_joining(event),
            NodeState::Initializing => self.st_initializing(event),
            NodeState::Coordinator => self.st_coordinator(event),
            NodeState::StandingForCoordinator => self.st_stand_for_coordinator(event),
            NodeState::ParticipatingInElection => self.st_voting(event),
            NodeState::Standby => self.st_standby(event),
            NodeState::Lost | NodeState::InNetworkTrouble => self.st_nw_error(event),
            NodeState::Dead | NodeState::AddMessageSent | NodeState::Shutdown => {
                // Never local states; recover by reloading.
                warn!(target: "wd", "invalid local watchdog state [{}]", self.local.state);
                self.set_state(NodeState::Loading);
            }
        }
    }

    /// Arm the deadline of the current state.
    fn arm_deadline(&mut self, timeout: LocalDuration) {
        self.state_deadline = Some(self.clock.local_time() + timeout);
        self.outbox.set_timer(timeout);
    }

    /// Issue a tracked cluster command with an empty payload.
    fn send_cluster_command(&mut self, send_to: SendTo, ty: MessageType, timeout: LocalDuration) {
        let id = self.commands.next_command_id();
        let packet = Packet::minimal(ty, id);

        if let Some(finished) =
            self.commands
                .submit(packet, CommandSource::Local, send_to, timeout, &mut self.peers)
        {
            self.finish_command(finished);
        }
    }

    // Loading /////////////////////////////////////////////////////////////

    /// Startup state: introduce ourselves to every connected peer and wait
    /// for their snapshots.
    fn st_loading(&mut self, event: StateEvent) {
        match event {
            StateEvent::Entered => {
                let targets: Vec<(NodeId, std::net::SocketAddr)> = self
                    .peers
                    .iter()
                    .filter(|p| p.is_reachable())
                    .filter_map(|p| p.send_addr().map(|a| (p.id, a)))
                    .collect();
                let snapshot = self.my_snapshot();

                for (node, addr) in targets {
                    let id = self.commands.next_command_id();
                    self.outbox
                        .message(addr, Packet::with_json(MessageType::AddNode, id, &snapshot));
                    if let Some(peer) = self.peers.get_mut(node) {
                        if peer.state == NodeState::Dead {
                            peer.state = NodeState::AddMessageSent;
                        }
                    }
                }
                self.arm_deadline(ELECTION_TIMEOUT);
            }
            StateEvent::Timeout => self.set_state(NodeState::Joining),
            StateEvent::Packet { node, pkt } => match pkt.ty {
                MessageType::StandForCoordinator => self.election_contested(node, &pkt),
                MessageType::Reject => self.add_node_rejected(node),
                _ => self.standard_packet(node, &pkt),
            },
            _ => {}
        }
    }

    /// Our `AddNode` was rejected: the cluster does not know us. This is a
    /// configuration problem no retry will fix.
    fn add_node_rejected(&mut self, node: NodeId) {
        let rejected = self
            .peers
            .get(node)
            .map_or(false, |p| {
                matches!(p.state, NodeState::AddMessageSent | NodeState::Dead)
            });

        if rejected {
            let name = self
                .peers
                .get(node)
                .map(|p| p.profile.name.clone())
                .unwrap_or_default();

            self.fatal(&format!(
                "add to watchdog cluster request is rejected by node \"{}\"; \
                 check the watchdog configurations",
                name
            ));
        }
    }

    /// A peer stood for coordinator while we are not yet part of an
    /// election. Decide purely on priority.
    fn election_contested(&mut self, node: NodeId, pkt: &Packet) {
        let Some((addr, their_priority)) = self
            .peers
            .get(node)
            .and_then(|p| p.send_addr().map(|a| (a, p.profile.priority)))
        else {
            return;
        };

        if self.local.priority > their_priority {
            self.outbox.reject(addr, pkt.command_id);
            self.set_state(NodeState::StandingForCoordinator);
        } else {
            self.outbox.accept(addr, pkt.command_id);
            self.set_state(NodeState::ParticipatingInElection);
        }
    }

    // Joining /////////////////////////////////////////////////////////////

    /// Intermediate state: refresh the cluster view before initializing.
    fn st_joining(&mut self, event: StateEvent) {
        match event {
            StateEvent::Entered => {
                self.master = ClusterMaster::Unknown;
                self.retry_unreachable_peers();
                self.send_cluster_command(SendTo::All, MessageType::RequestInfo, REQUEST_INFO_TIMEOUT);
                self.arm_deadline(ELECTION_TIMEOUT);
            }
            StateEvent::Timeout => self.set_state(NodeState::Initializing),
            StateEvent::CommandFinished(command) => {
                if command.packet.ty == MessageType::RequestInfo {
                    self.set_state(NodeState::Initializing);
                }
            }
            StateEvent::Packet { node, pkt } => match pkt.ty {
                MessageType::StandForCoordinator => self.election_contested(node, &pkt),
                MessageType::Reject => self.add_node_rejected(node),
                _ => self.standard_packet(node, &pkt),
            },
            _ => {}
        }
    }

    // Initializing ////////////////////////////////////////////////////////

    /// Decide our place in the cluster: follow a known coordinator, take
    /// the single-node fast path, or enter the election.
    fn st_initializing(&mut self, event: StateEvent) {
        match event {
            StateEvent::Entered => {
                // A short settle delay keeps this from recursing through
                // the states on a busy startup.
                self.arm_deadline(SETTLE_TIMEOUT);
            }
            StateEvent::Timeout => {
                if matches!(self.master, ClusterMaster::Remote(_)) {
                    self.set_state(NodeState::Standby);
                } else if self.peers.active_count() == 0 {
                    info!(
                        target: "wd",
                        "I am the only alive node in the watchdog cluster, \
                         skipping stand for coordinator state"
                    );
                    self.set_state(NodeState::Coordinator);
                } else if self
                    .peers
                    .iter()
                    .any(|p| p.state == NodeState::StandingForCoordinator)
                {
                    self.set_state(NodeState::ParticipatingInElection);
                } else {
                    self.set_state(NodeState::StandingForCoordinator);
                }
            }
            StateEvent::Packet { node, pkt } => match pkt.ty {
                MessageType::Reject => self.add_node_rejected(node),
                _ => self.standard_packet(node, &pkt),
            },
            _ => {}
        }
    }

    // Standing for coordinator ////////////////////////////////////////////

    fn st_stand_for_coordinator(&mut self, event: StateEvent) {
        match event {
            StateEvent::Entered => {
                self.send_cluster_command(
                    SendTo::All,
                    MessageType::StandForCoordinator,
                    ELECTION_TIMEOUT,
                );
                self.arm_deadline(ELECTION_TIMEOUT);
            }
            StateEvent::Timeout => self.set_state(NodeState::Coordinator),
            StateEvent::CommandFinished(command) => self.stand_command_finished(command),
            StateEvent::Packet { node, pkt } => match pkt.ty {
                MessageType::StandForCoordinator => self.stand_against(node, &pkt),
                MessageType::DeclareCoordinator => {
                    // Someone else finished their election first.
                    let Some((addr, their_priority)) = self
                        .peers
                        .get(node)
                        .and_then(|p| p.send_addr().map(|a| (a, p.profile.priority)))
                    else {
                        return;
                    };

                    if self.local.priority > their_priority {
                        info!(
                            target: "wd",
                            "rejecting the declare coordinator request from node {}: \
                             our priority {} is higher than {}",
                            node, self.local.priority, their_priority
                        );
                        self.outbox.reject(addr, pkt.command_id);
                    } else {
                        info!(target: "wd", "node {} has declared itself coordinator", node);
                        self.outbox.accept(addr, pkt.command_id);
                        self.set_state(NodeState::Joining);
                    }
                }
                _ => self.standard_packet(node, &pkt),
            },
            _ => {}
        }
    }

    fn stand_command_finished(&mut self, command: ClusterCommand) {
        if command.packet.ty != MessageType::StandForCoordinator {
            return;
        }

        match command.status {
            CommandStatus::AllReplied | CommandStatus::Timeout => {
                self.set_state(NodeState::Coordinator);
            }
            CommandStatus::NodeRejected => {
                info!(target: "wd", "our stand for coordinator request was rejected");
                match command.failed_reply {
                    Some((_, MessageType::Reject)) => {
                        self.set_state(NodeState::ParticipatingInElection)
                    }
                    _ => self.set_state(NodeState::Joining),
                }
            }
            _ => self.set_state(NodeState::Joining),
        }
    }

    /// A competing `StandForCoordinator` while we stand ourselves. Priority
    /// decides; equal priorities go to the older node.
    fn stand_against(&mut self, node: NodeId, pkt: &Packet) {
        let Some((addr, their_priority, their_startup)) = self.peers.get(node).and_then(|p| {
            p.send_addr()
                .map(|a| (a, p.profile.priority, p.startup_time))
        }) else {
            return;
        };

        if self.local.priority > their_priority {
            self.outbox.reject(addr, pkt.command_id);
        } else if self.local.priority == their_priority {
            if self.local.startup_time <= their_startup {
                // We are the older node.
                self.outbox.reject(addr, pkt.command_id);
            } else {
                self.outbox.accept(addr, pkt.command_id);
                self.set_state(NodeState::ParticipatingInElection);
            }
        } else {
            self.outbox.accept(addr, pkt.command_id);
            self.set_state(NodeState::ParticipatingInElection);
        }
    }

    // Coordinator /////////////////////////////////////////////////////////

    fn st_coordinator(&mut self, event: StateEvent) {
        match event {
            StateEvent::Entered => {
                self.send_cluster_command(
                    SendTo::All,
                    MessageType::DeclareCoordinator,
                    ELECTION_TIMEOUT,
                );
                info!(
                    target: "wd",
                    "I am announcing myself as the cluster coordinator node"
                );
                // The election may have temporarily lowered our priority.
                self.local.priority = self.config.local.priority;
            }
            StateEvent::CommandFinished(command) => self.coordinator_command_finished(command),
            StateEvent::QuorumChanged => {
                let status = self.local.quorum_status;

                if self.master == ClusterMaster::Local {
                    if status < 0 {
                        warn!(target: "wd", "we have lost the quorum");
                        if self.escalation.escalated {
                            // Keeping the VIP without the quorum risks a
                            // split-brain.
                            self.escalation.de_escalate();
                            self.outbox
                                .push(Event::EscalationChanged { escalated: false }.into());
                        }
                    } else if !self.escalation.escalated {
                        info!(target: "wd", "quorum found, starting escalation");
                        self.escalation.escalate();
                        self.outbox
                            .push(Event::EscalationChanged { escalated: true }.into());
                    }
                    self.broadcast_info();
                }
                self.outbox.push(Event::QuorumChanged { status }.into());
            }
            StateEvent::RemoteLost(node) => {
                self.standby_left(node);
            }
            StateEvent::Packet { node, pkt } => match pkt.ty {
                MessageType::StandForCoordinator => {
                    if let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) {
                        self.outbox.reject(addr, pkt.command_id);
                    }
                }
                MessageType::DeclareCoordinator => {
                    warn!(
                        target: "wd",
                        "we are the coordinator and node {} tried a coup", node
                    );
                    if let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) {
                        self.outbox.error(addr, pkt.command_id);
                    }
                }
                _ => self.standard_packet(node, &pkt),
            },
            _ => {}
        }
    }

    fn coordinator_command_finished(&mut self, command: ClusterCommand) {
        match command.packet.ty {
            MessageType::DeclareCoordinator => match command.status {
                CommandStatus::AllReplied | CommandStatus::Timeout => {
                    info!(
                        target: "wd",
                        "I am the cluster leader node: our declare coordinator message \
                         is accepted by all nodes"
                    );
                    self.become_master();
                }
                _ => {
                    warn!(
                        target: "wd",
                        "possible split-brain scenario detected, re-initializing cluster"
                    );
                    self.set_state(NodeState::Joining);
                }
            },
            MessageType::IAmCoordinator => {
                if command.status == CommandStatus::NodeRejected {
                    // A standby no longer accepts our beacon.
                    if let Some((node, _)) = command.failed_reply {
                        warn!(
                            target: "wd",
                            "node {} has rejected our coordinator beacon, \
                             removing it from the standby list",
                            node
                        );
                        self.standby_left(node);
                    }
                }
            }
            _ => {}
        }
    }

    /// The cluster accepted our coordinatorship.
    fn become_master(&mut self) {
        self.master = ClusterMaster::Local;
        self.next_beacon = Some(self.clock.local_time() + BEACON_INTERVAL);
        self.update_quorum();

        if self.local.quorum_status < 0 {
            info!(
                target: "wd",
                "I am the cluster leader node but we do not have enough nodes in cluster, \
                 waiting for the quorum to start the escalation process"
            );
        } else if !self.escalation.escalated {
            info!(target: "wd", "I am the cluster leader node, starting escalation process");
            self.escalation.escalate();
            self.outbox
                .push(Event::EscalationChanged { escalated: true }.into());
            self.broadcast_info();
        }
    }

    // Participating in election ///////////////////////////////////////////

    fn st_voting(&mut self, event: StateEvent) {
        match event {
            StateEvent::Entered => self.arm_deadline(ELECTION_TIMEOUT),
            StateEvent::Timeout => self.set_state(NodeState::Joining),
            StateEvent::Packet { node, pkt } => match pkt.ty {
                MessageType::StandForCoordinator => {
                    let Some((addr, their_priority)) = self
                        .peers
                        .get(node)
                        .and_then(|p| p.send_addr().map(|a| (a, p.profile.priority)))
                    else {
                        return;
                    };

                    if their_priority >= self.local.priority {
                        self.outbox.accept(addr, pkt.command_id);
                    } else {
                        self.outbox.reject(addr, pkt.command_id);
                        self.set_state(NodeState::StandingForCoordinator);
                    }
                }
                MessageType::DeclareCoordinator => {
                    let Some((addr, their_priority)) = self
                        .peers
                        .get(node)
                        .and_then(|p| p.send_addr().map(|a| (a, p.profile.priority)))
                    else {
                        return;
                    };

                    if their_priority >= self.local.priority {
                        self.outbox.accept(addr, pkt.command_id);
                        self.set_state(NodeState::Initializing);
                    } else {
                        self.outbox.reject(addr, pkt.command_id);
                        self.set_state(NodeState::StandingForCoordinator);
                    }
                }
                MessageType::IAmCoordinator => self.set_state(NodeState::Joining),
                _ => self.standard_packet(node, &pkt),
            },
            _ => {}
        }
    }

    // Standby /////////////////////////////////////////////////////////////

    fn st_standby(&mut self, event: StateEvent) {
        match event {
            StateEvent::Entered => {
                let ClusterMaster::Remote(master) = self.master else {
                    self.set_state(NodeState::Joining);
                    return;
                };

                self.send_cluster_command(
                    SendTo::Node(master),
                    MessageType::JoinCoordinator,
                    ELECTION_TIMEOUT,
                );
                self.local.priority = self.config.local.priority;
            }
            StateEvent::CommandFinished(command) => {
                if command.packet.ty != MessageType::JoinCoordinator {
                    return;
                }
                match command.status {
                    CommandStatus::AllReplied | CommandStatus::Timeout => {
                        info!(
                            target: "wd",
                            "successfully joined the watchdog cluster as standby node"
                        );
                    }
                    _ => {
                        warn!(
                            target: "wd",
                            "our join coordinator request was rejected, rejoining the cluster"
                        );
                        self.set_state(NodeState::Joining);
                    }
                }
            }
            StateEvent::RemoteLost(_) => {
                if self.master == ClusterMaster::Unknown {
                    warn!(target: "wd", "we have lost the cluster coordinator node");
                    self.set_state(NodeState::Joining);
                }
            }
            StateEvent::Packet { node, pkt } => match pkt.ty {
                MessageType::StandForCoordinator => {
                    let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) else {
                        return;
                    };

                    if self.master == ClusterMaster::Unknown {
                        self.outbox.accept(addr, pkt.command_id);
                        self.set_state(NodeState::ParticipatingInElection);
                    } else {
                        // An election while we follow a healthy coordinator
                        // means the cluster views have diverged.
                        self.outbox.error(addr, pkt.command_id);
                        self.set_state(NodeState::Joining);
                    }
                }
                MessageType::DeclareCoordinator => {
                    if self.master == ClusterMaster::Remote(node) {
                        self.set_state(NodeState::Joining);
                    } else if let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) {
                        self.outbox.error(addr, pkt.command_id);
                    }
                }
                _ => self.standard_packet(node, &pkt),
            },
            _ => {}
        }
    }

    /// Make sure the coordinator is still talking to us. Called once per
    /// second while standby.
    pub(crate) fn standby_master_check(&mut self) {
        let ClusterMaster::Remote(master) = self.master else {
            return;
        };
        let Some(peer) = self.peers.get(master) else {
            return;
        };
        let Some(last_recv) = peer.last_recv else {
            return;
        };
        let silence = self.clock.local_time() - last_recv;
        let addr = peer.send_addr();

        if silence >= MASTER_LOST_TIMEOUT {
            // We have missed at least two beacons and the probe.
            warn!(
                target: "wd",
                "no beacon from the coordinator and no reply to our info request, \
                 re-initializing the cluster"
            );
            self.set_state(NodeState::Joining);
        } else if silence >= MASTER_PROBE_TIMEOUT {
            warn!(target: "wd", "no beacon from the coordinator, requesting its info");
            if let Some(addr) = addr {
                let id = self.commands.next_command_id();
                self.outbox.minimal(addr, MessageType::RequestInfo, id);
            }
        }
    }

    // Network error ///////////////////////////////////////////////////////

    /// Total network blackout. The default policy is to exit: an isolated
    /// node quickly accumulates a backend view the cluster will not share.
    /// With the policy off we wait for the network and rejoin.
    fn st_nw_error(&mut self, event: StateEvent) {
        match event {
            StateEvent::Entered => {
                if self.config.exit_on_network_trouble {
                    self.fatal("system has lost the network");
                } else {
                    self.arm_deadline(NETWORK_RETRY_TIMEOUT);
                }
            }
            StateEvent::Timeout => {
                // Still in trouble? Check whether an address came back.
                self.network_recovered();
                if matches!(
                    self.local.state,
                    NodeState::Lost | NodeState::InNetworkTrouble
                ) {
                    self.arm_deadline(NETWORK_RETRY_TIMEOUT);
                }
            }
            StateEvent::Packet { .. } => {
                // We believe the network is gone yet a packet arrived;
                // maybe it is back and we failed to notice.
                self.network_recovered();
            }
            _ => {}
        }
    }

    // Split-brain /////////////////////////////////////////////////////////

    /// Decide the worthier of two coordinators.
    ///
    /// Returns `1` when the local node should stay coordinator, `-1` when
    /// the remote one should, `0` when the question cannot be decided
    /// (missing beacon data from the peer).
    pub(crate) fn split_brain_decision(&self, node: NodeId) -> i8 {
        let Some(peer) = self.peers.get(node) else {
            return 0;
        };

        if self.local.state != NodeState::Coordinator || peer.state != NodeState::Coordinator {
            return 0;
        }
        if !peer.beacon_seen {
            info!(
                target: "wd",
                "not enough data to decide the coordinator: node \"{}\" \
                 never sent its beacon fields",
                peer.profile.name
            );
            return 0;
        }

        let local_escalated = self.escalation.escalated;
        if peer.escalated != local_escalated {
            // Whoever holds the virtual IP stays.
            return if peer.escalated { -1 } else { 1 };
        }
        if peer.quorum_status != self.local.quorum_status {
            return if peer.quorum_status > self.local.quorum_status {
                -1
            } else {
                1
            };
        }
        let local_standbys = self.standbys.len() as u32;
        if peer.standby_count != local_standbys {
            return if peer.standby_count > local_standbys {
                -1
            } else {
                1
            };
        }
        // The older coordinatorship survives.
        if peer.current_state_since < self.local.current_state_since {
            -1
        } else {
            1
        }
    }

    /// Resolve a split-brain between us and another coordinator.
    pub(crate) fn handle_split_brain(&mut self, node: NodeId) {
        match self.split_brain_decision(node) {
            0 => {
                warn!(
                    target: "wd",
                    "cluster is in split-brain and the best coordinator cannot be decided, \
                     re-initializing"
                );
                if let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) {
                    let id = self.commands.next_command_id();
                    self.outbox
                        .cluster_service(addr, id, ClusterServiceCode::NeedsElection);
                }
                self.set_state(NodeState::Joining);
            }
            -1 => {
                info!(
                    target: "wd",
                    "cluster is in split-brain and node {} is the best coordinator candidate, \
                     stepping down",
                    node
                );
                self.broadcast_cluster_service(ClusterServiceCode::IamNotTrueMaster);
                self.set_state(NodeState::Joining);
            }
            _ => {
                info!(
                    target: "wd",
                    "cluster is in split-brain and we are the best coordinator candidate, \
                     asking node {} to step down",
                    node
                );
                if let Some(addr) = self.peers.get(node).and_then(|p| p.send_addr()) {
                    let id = self.commands.next_command_id();
                    self.outbox
                        .cluster_service(addr, id, ClusterServiceCode::IamTrueMaster);
                }
            }
        }
    }
}
