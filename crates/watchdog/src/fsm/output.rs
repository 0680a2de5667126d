//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
//!
//! Each manager (peers, commands, election) is given a copy of this outbox
//! with specific capabilities, eg. peer disconnection, message sending etc.
//! to communicate with the network.

use std::collections::VecDeque;
use std::net;
use std::sync::{Arc, Mutex};

use tracing::trace;

use pgward_types::messages::{ClusterServiceCode, MessageType, Packet};
use pgward_types::node::NodeSnapshot;

use crate::fsm::event::Event;
use crate::fsm::handler::DisconnectReason;
use crate::net::LocalDuration;

/// Output of a state transition of the watchdog state machine.
pub type Io = crate::net::Io<Packet, Event, DisconnectReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to connect to peers.
pub trait Connect {
    /// Connect to peer.
    fn connect(&self, addr: net::SocketAddr);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Disconnect from peer.
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// Watchdog wire protocol.
pub trait Wire {
    /// Emit an event.
    fn event(&self, event: Event);

    /// Send a raw packet to a peer connection.
    fn message(&mut self, addr: net::SocketAddr, packet: Packet) -> &mut Self;

    /// Send a minimal (payload-less) message.
    fn minimal(&mut self, addr: net::SocketAddr, ty: MessageType, command_id: u32) -> &mut Self {
        self.message(addr, Packet::minimal(ty, command_id))
    }

    /// Reply `Accept` to a packet.
    fn accept(&mut self, addr: net::SocketAddr, command_id: u32) -> &mut Self {
        self.minimal(addr, MessageType::Accept, command_id)
    }

    /// Reply `Reject` to a packet.
    fn reject(&mut self, addr: net::SocketAddr, command_id: u32) -> &mut Self {
        self.minimal(addr, MessageType::Reject, command_id)
    }

    /// Reply `Error` to a packet.
    fn error(&mut self, addr: net::SocketAddr, command_id: u32) -> &mut Self {
        self.minimal(addr, MessageType::Error, command_id)
    }

    /// Send a node `Info` snapshot.
    fn info(&mut self, addr: net::SocketAddr, command_id: u32, snapshot: &NodeSnapshot) -> &mut Self {
        self.message(addr, Packet::with_json(MessageType::Info, command_id, snapshot))
    }

    /// Send a cluster service sub-code.
    fn cluster_service(
        &mut self,
        addr: net::SocketAddr,
        command_id: u32,
        code: ClusterServiceCode,
    ) -> &mut Self {
        self.message(addr, Packet::cluster_service(command_id, code))
    }
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    /// Output queue.
    outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.lock().unwrap().pop_front()
    }
}

impl Outbox {
    /// Create a new outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound.lock().unwrap().push_back(output);
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {
        trace!(target: "wd", "Disconnecting from {}: {}", addr, reason);

        self.push(Io::Disconnect(addr, reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: net::SocketAddr) {
        self.push(Io::Connect(addr));
    }
}

impl Wire for Outbox {
    fn event(&self, event: Event) {
        trace!(target: "wd", "{}", &event);
        self.push(Io::Event(event));
    }

    fn message(&mut self, addr: net::SocketAddr, packet: Packet) -> &mut Self {
        trace!(target: "wd", "Sending {} (id {}) to {}", packet.ty, packet.command_id, addr);

        self.push(Io::Write(addr, packet));
        self
    }
}
