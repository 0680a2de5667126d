//! Tracking of in-flight multi-peer commands.
//!
//! A cluster command is one packet sent to one peer or to all of them,
//! with per-peer reply bookkeeping, a deadline, and a completion status the
//! election logic dispatches on. Commands originating from the IPC surface
//! additionally carry the channel their final result is written to.

use flume as chan;
use tracing::{debug, trace};

use pgward_types::ipc::{IpcCommandType, IpcResponse};
use pgward_types::messages::{MessageType, Packet};
use pgward_types::node::NodeId;

use crate::fsm::output::Wire;
use crate::fsm::peermgr::PeerManager;
use crate::net::{Clock, LocalDuration, LocalTime};

/// Default reply deadline of a cluster command.
pub const DEFAULT_COMMAND_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);

/// Where a command came from.
#[derive(Debug)]
pub enum CommandSource {
    /// Issued by the local state machine (election, beacon).
    Local,
    /// Submitted over the IPC socket; the result goes back on the channel.
    Ipc {
        ty: IpcCommandType,
        reply: chan::Sender<IpcResponse>,
    },
    /// Replicated from a remote peer; the result is sent back on the wire
    /// under the peer's original command id.
    Remote { node: NodeId, command_id: u32 },
}

/// Destination of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTo {
    /// Every active, reachable peer.
    All,
    /// A single peer.
    Node(NodeId),
}

/// Per-peer progress of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCmdState {
    Init,
    Sent,
    Replied,
    SendError,
    DoNotSend,
}

/// Completion status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    InProgress,
    /// Every peer the packet reached has replied positively.
    AllReplied,
    /// The deadline passed with replies missing.
    Timeout,
    /// Some peer replied `Reject` or `Error`.
    NodeRejected,
    /// The packet could not be written to any peer.
    SendFailed,
}

/// Reply bookkeeping for one peer.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node: NodeId,
    pub state: NodeCmdState,
    pub reply: Option<MessageType>,
}

/// An in-flight multi-peer command.
#[derive(Debug)]
pub struct ClusterCommand {
    pub packet: Packet,
    pub source: CommandSource,
    pub send_to: SendTo,
    pub results: Vec<NodeResult>,
    pub send_count: u32,
    pub reply_count: u32,
    pub send_error_count: u32,
    pub started_at: LocalTime,
    pub timeout: LocalDuration,
    pub status: CommandStatus,
    /// The negative reply that finished the command, when it was rejected.
    pub failed_reply: Option<(NodeId, MessageType)>,
    /// Payload of a `Data`/`CmdReplyInData` reply, for data commands.
    pub reply_data: Option<Vec<u8>>,
}

impl ClusterCommand {
    /// The command id correlating replies to this command.
    pub fn command_id(&self) -> u32 {
        self.packet.command_id
    }
}

/// Manages in-flight commands.
#[derive(Debug)]
pub struct CommandManager<U, C> {
    commands: Vec<ClusterCommand>,
    next_command_id: u32,
    upstream: U,
    clock: C,
}

impl<U: Wire, C: Clock> CommandManager<U, C> {
    pub fn new(upstream: U, clock: C) -> Self {
        Self {
            commands: Vec::new(),
            next_command_id: 0,
            upstream,
            clock,
        }
    }

    /// Allocate the next command id. Monotonically increasing per process.
    pub fn next_command_id(&mut self) -> u32 {
        self.next_command_id = self.next_command_id.wrapping_add(1);
        self.next_command_id
    }

    /// Whether a command with this id is still in flight.
    pub fn is_tracked(&self, command_id: u32) -> bool {
        self.commands.iter().any(|c| c.command_id() == command_id)
    }

    /// Send a packet to its destination peers and start tracking replies.
    ///
    /// Completes immediately, and is returned instead of tracked, when
    /// nothing had to be sent: vacuously successful for local commands
    /// (single-node cluster), a send failure for forwarded ones.
    pub fn submit<PU, PC: Clock>(
        &mut self,
        packet: Packet,
        source: CommandSource,
        send_to: SendTo,
        timeout: LocalDuration,
        peers: &mut PeerManager<PU, PC>,
    ) -> Option<ClusterCommand> {
        let mut command = ClusterCommand {
            packet,
            source,
            send_to,
            results: Vec::new(),
            send_count: 0,
            reply_count: 0,
            send_error_count: 0,
            started_at: self.clock.local_time(),
            timeout,
            status: CommandStatus::InProgress,
            failed_reply: None,
            reply_data: None,
        };

        let targets: Vec<NodeId> = match send_to {
            SendTo::All => peers.iter().map(|p| p.id).collect(),
            SendTo::Node(id) => vec![id],
        };

        for id in targets {
            let state = match peers.get(id) {
                Some(peer) if peer.is_active() && peer.is_reachable() => {
                    let addr = peer.send_addr().expect("reachable peers have a link");

                    self.upstream.message(addr, command.packet.clone());
                    peers.message_sent(id);
                    command.send_count += 1;
                    NodeCmdState::Sent
                }
                // An active peer that is momentarily unreachable gets the
                // packet once its connection is restored.
                Some(peer) if peer.is_active() => {
                    command.send_error_count += 1;
                    NodeCmdState::SendError
                }
                _ => NodeCmdState::DoNotSend,
            };
            command.results.push(NodeResult {
                node: id,
                state,
                reply: None,
            });
        }

        trace!(
            target: "wd",
            "command {} ({}) sent to {} node(s)",
            command.command_id(),
            command.packet.ty,
            command.send_count,
        );

        if command.send_count == 0 {
            command.status = match command.source {
                CommandSource::Local => CommandStatus::AllReplied,
                _ => CommandStatus::SendFailed,
            };
            return Some(command);
        }

        self.commands.push(command);
        None
    }

    /// A reply arrived from a peer. Returns the command when it completed.
    ///
    /// A second reply from the same peer to the same command id is ignored.
    pub fn reply_received(&mut self, node: NodeId, pkt: &Packet) -> Option<ClusterCommand> {
        let index = self
            .commands
            .iter()
            .position(|c| c.command_id() == pkt.command_id)?;
        let command = &mut self.commands[index];
        let result = command.results.iter_mut().find(|r| r.node == node)?;

        if result.state == NodeCmdState::Replied {
            trace!(
                target: "wd",
                "ignoring duplicate reply from node {} to command {}",
                node,
                pkt.command_id,
            );
            return None;
        }

        result.state = NodeCmdState::Replied;
        result.reply = Some(pkt.ty);
        command.reply_count += 1;

        if matches!(pkt.ty, MessageType::Data | MessageType::CmdReplyInData) {
            command.reply_data = Some(pkt.payload.clone());
        }

        debug!(
            target: "wd",
            "node {} replied {} to command {} ({}/{})",
            node,
            pkt.ty,
            pkt.command_id,
            command.reply_count,
            command.send_count,
        );

        if matches!(pkt.ty, MessageType::Reject | MessageType::Error) {
            // A negative reply from any node finishes the command.
            command.status = CommandStatus::NodeRejected;
            command.failed_reply = Some((node, pkt.ty));
            return Some(self.commands.remove(index));
        }
        if command.reply_count >= command.send_count {
            command.status = CommandStatus::AllReplied;
            return Some(self.commands.remove(index));
        }
        None
    }

    /// A peer went away: its pending slots no longer count. Returns the
    /// commands this completed.
    pub fn node_lost(&mut self, node: NodeId) -> Vec<ClusterCommand> {
        let mut finished = Vec::new();
        let mut index = 0;

        while index < self.commands.len() {
            let command = &mut self.commands[index];
            let affected = command
                .results
                .iter_mut()
                .find(|r| r.node == node && r.state == NodeCmdState::Sent);

            if let Some(result) = affected {
                result.state = NodeCmdState::DoNotSend;
                command.send_count -= 1;

                if command.send_count == 0 || command.reply_count >= command.send_count {
                    command.status = if command.send_count == 0 && command.reply_count == 0 {
                        CommandStatus::SendFailed
                    } else {
                        CommandStatus::AllReplied
                    };
                    finished.push(self.commands.remove(index));
                    continue;
                }
            }
            index += 1;
        }
        finished
    }

    /// A peer became reachable again: retry the slots that failed to send.
    pub fn node_found<PU, PC: Clock>(&mut self, node: NodeId, peers: &mut PeerManager<PU, PC>) {
        for command in self.commands.iter_mut() {
            let Some(result) = command
                .results
                .iter_mut()
                .find(|r| r.node == node && r.state == NodeCmdState::SendError)
            else {
                continue;
            };
            let Some(addr) = peers.get(node).and_then(|p| p.send_addr()) else {
                continue;
            };

            self.upstream.message(addr, command.packet.clone());
            peers.message_sent(node);
            result.state = NodeCmdState::Sent;
            command.send_count += 1;
            command.send_error_count = command.send_error_count.saturating_sub(1);
        }
    }

    /// Expire commands whose deadline passed. Returns them with status
    /// `Timeout`.
    pub fn sweep(&mut self) -> Vec<ClusterCommand> {
        let now = self.clock.local_time();
        let mut finished = Vec::new();
        let mut index = 0;

        while index < self.commands.len() {
            if now - self.commands[index].started_at >= self.commands[index].timeout {
                let mut command = self.commands.remove(index);

                command.status = CommandStatus::Timeout;
                finished.push(command);
                continue;
            }
            index += 1;
        }
        finished
    }

    /// Drop every in-flight command.
    pub fn clear(&mut self) -> Vec<ClusterCommand> {
        std::mem::take(&mut self.commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Outbox;
    use crate::fsm::peermgr::{self, PeerConfig};
    use crate::net::{Link, RefClock};
    use pgward_types::node::{NodeProfile, NodeState};
    use std::net::SocketAddr;

    fn peers(count: u16) -> (PeerManager<Outbox, RefClock>, RefClock) {
        let clock = RefClock::new(crate::net::LocalTime::from_secs(500));
        let configs = (0..count)
            .map(|i| PeerConfig {
                profile: NodeProfile {
                    name: format!("wd{}", i + 1),
                    host: "127.0.0.1".into(),
                    wd_port: 9000 + i,
                    app_port: 10000 + i,
                    priority: 1,
                    delegate_ip: String::new(),
                },
                addr: ([127, 0, 0, 1], 9000 + i).into(),
            })
            .collect();
        let mut mgr = PeerManager::new(
            peermgr::Config {
                peers: configs,
                auth_key: None,
            },
            Outbox::new(),
            clock.clone(),
        );

        for i in 0..count {
            let addr: SocketAddr = ([127, 0, 0, 1], 9000 + i).into();
            mgr.connected(addr, Link::Outbound);
            mgr.get_mut(i as u32 + 1).unwrap().state = NodeState::Standby;
        }
        (mgr, clock)
    }

    fn submit_all(
        mgr: &mut CommandManager<Outbox, RefClock>,
        peers: &mut PeerManager<Outbox, RefClock>,
    ) -> u32 {
        let id = mgr.next_command_id();
        let packet = Packet::minimal(MessageType::StandForCoordinator, id);

        assert!(mgr
            .submit(
                packet,
                CommandSource::Local,
                SendTo::All,
                DEFAULT_COMMAND_TIMEOUT,
                peers,
            )
            .is_none());
        id
    }

    #[test]
    fn completes_when_every_node_replied() {
        let (mut peer_mgr, clock) = peers(2);
        let mut mgr = CommandManager::new(Outbox::new(), clock);
        let id = submit_all(&mut mgr, &mut peer_mgr);

        assert!(mgr
            .reply_received(1, &Packet::minimal(MessageType::Accept, id))
            .is_none());
        let finished = mgr
            .reply_received(2, &Packet::minimal(MessageType::Accept, id))
            .unwrap();

        assert_eq!(finished.status, CommandStatus::AllReplied);
        assert!(!mgr.is_tracked(id));
    }

    #[test]
    fn a_reject_finishes_the_command_early() {
        let (mut peer_mgr, clock) = peers(3);
        let mut mgr = CommandManager::new(Outbox::new(), clock);
        let id = submit_all(&mut mgr, &mut peer_mgr);

        let finished = mgr
            .reply_received(2, &Packet::minimal(MessageType::Reject, id))
            .unwrap();

        assert_eq!(finished.status, CommandStatus::NodeRejected);
        assert_eq!(finished.failed_reply, Some((2, MessageType::Reject)));
    }

    #[test]
    fn duplicate_replies_are_coalesced() {
        let (mut peer_mgr, clock) = peers(2);
        let mut mgr = CommandManager::new(Outbox::new(), clock);
        let id = submit_all(&mut mgr, &mut peer_mgr);

        assert!(mgr
            .reply_received(1, &Packet::minimal(MessageType::Accept, id))
            .is_none());
        // The same node replying again must not complete the command.
        assert!(mgr
            .reply_received(1, &Packet::minimal(MessageType::Accept, id))
            .is_none());
        assert!(mgr.is_tracked(id));
    }

    #[test]
    fn node_loss_can_complete_a_command() {
        let (mut peer_mgr, clock) = peers(2);
        let mut mgr = CommandManager::new(Outbox::new(), clock);
        let id = submit_all(&mut mgr, &mut peer_mgr);

        assert!(mgr
            .reply_received(1, &Packet::minimal(MessageType::Accept, id))
            .is_none());
        let finished = mgr.node_lost(2);

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, CommandStatus::AllReplied);
    }

    #[test]
    fn deadline_expires_commands() {
        let (mut peer_mgr, clock) = peers(2);
        let mut mgr = CommandManager::new(Outbox::new(), clock.clone());
        submit_all(&mut mgr, &mut peer_mgr);

        clock.elapse(LocalDuration::from_secs(4));
        assert!(mgr.sweep().is_empty());

        clock.elapse(LocalDuration::from_secs(2));
        let finished = mgr.sweep();

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, CommandStatus::Timeout);
    }

    #[test]
    fn local_command_with_no_targets_is_vacuously_complete() {
        let (mut peer_mgr, clock) = peers(0);
        let mut mgr = CommandManager::new(Outbox::new(), clock);
        let id = mgr.next_command_id();

        let finished = mgr
            .submit(
                Packet::minimal(MessageType::DeclareCoordinator, id),
                CommandSource::Local,
                SendTo::All,
                DEFAULT_COMMAND_TIMEOUT,
                &mut peer_mgr,
            )
            .unwrap();

        assert_eq!(finished.status, CommandStatus::AllReplied);
    }
}
