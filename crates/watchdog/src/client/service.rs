//! The reactor-facing service: decodes wire frames and drives the
//! watchdog state machine.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, error};

use crate::client::stream::Decoder;
use crate::fsm::event::Event;
use crate::fsm::handler::{Command, Config, DisconnectReason, StateMachine};
use crate::fsm::ifmgr::LinkMonitor;
use crate::fsm::output;
use crate::net::{Disconnect, Io, Link, LocalTime, RefClock};

/// Client service. Wraps the state machine and handles decoding and
/// encoding of wire messages.
pub struct Service {
    inboxes: HashMap<SocketAddr, Decoder>,
    machine: StateMachine<RefClock>,
    clock: RefClock,
}

impl Service {
    /// Create a new client service.
    pub fn new(config: Config, ifmon: Box<dyn LinkMonitor + Send>, clock: RefClock) -> Self {
        Self {
            inboxes: HashMap::new(),
            machine: StateMachine::new(config, ifmon, clock.clone()),
            clock,
        }
    }

    /// Direct access to the state machine. Used by the state-machine tests.
    pub fn machine(&mut self) -> &mut StateMachine<RefClock> {
        &mut self.machine
    }
}

impl crate::net::Service for Service {
    type Command = Command;

    fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd)
    }
}

impl crate::net::StateMachine for Service {
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.machine.initialize(time);
    }

    fn message_received(&mut self, addr: &SocketAddr, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.inboxes.get_mut(addr) else {
            debug!(target: "wd", "received message from unknown connection {}", addr);
            return;
        };

        inbox.input(&bytes);

        loop {
            match inbox.decode_next() {
                Ok(Some(packet)) => self.machine.packet_received(addr, packet),
                Ok(None) => break,
                Err(err) => {
                    error!(target: "wd", "invalid message received from {}: {}", addr, err);
                    self.machine.disconnect(*addr, DisconnectReason::InvalidFrame);
                    return;
                }
            }
        }
    }

    fn attempted(&mut self, addr: &SocketAddr) {
        self.machine.attempted(addr)
    }

    fn connected(&mut self, addr: SocketAddr, local_addr: &SocketAddr, link: Link) {
        self.inboxes.insert(addr, Decoder::new(1024));
        self.machine.connected(addr, local_addr, link);
    }

    fn disconnected(&mut self, addr: &SocketAddr, reason: Disconnect<DisconnectReason>) {
        self.inboxes.remove(addr);
        self.machine.disconnected(addr, reason)
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);
        self.machine.tick();
    }

    fn timer_expired(&mut self) {
        self.machine.timer_expired();
    }
}

impl Iterator for Service {
    type Item = Io<Vec<u8>, Event, DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.machine.next() {
            Some(output::Io::Write(addr, packet)) => Some(Io::Write(addr, packet.encode())),
            Some(output::Io::Event(e)) => Some(Io::Event(e)),
            Some(output::Io::Connect(a)) => Some(Io::Connect(a)),
            Some(output::Io::Disconnect(a, r)) => Some(Io::Disconnect(a, r)),
            Some(output::Io::SetTimer(d)) => Some(Io::SetTimer(d)),

            None => None,
        }
    }
}
