//! Deterministic cluster tests: several state machines wired through an
//! in-memory network with a hand-driven clock.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use flume as chan;

use pgward_types::consensus::FailoverKind;
use pgward_types::ipc::{FailoverPhase, IpcResponse, IpcResultType};
use pgward_types::messages::{FailoverRequestPayload, MessageType, Packet};
use pgward_types::node::{NodeProfile, NodeState};

use crate::fsm::escalation;
use crate::fsm::event::Event;
use crate::fsm::handler::{ClusterMaster, Command, Config, StateMachine};
use crate::fsm::ifmgr::ManualLinkMonitor;
use crate::fsm::output::Io;
use crate::fsm::peermgr::PeerConfig;
use crate::fsm::votemgr;
use crate::net::{Disconnect, Link, LocalDuration, LocalTime, RefClock};
use crate::net::time::Clock;

/// The listen address of node `i`.
fn listen_addr(i: usize) -> SocketAddr {
    ([127, 0, 0, 1], 9000 + i as u16).into()
}

/// The address node `to` sees node `from`'s dialed connection under.
fn inbound_addr(from: usize, to: usize) -> SocketAddr {
    ([127, 0, (from + 1) as u8, (to + 1) as u8], 50000).into()
}

fn profile(i: usize, priority: i16) -> NodeProfile {
    NodeProfile {
        name: format!("wd{}", i),
        host: "127.0.0.1".into(),
        wd_port: 9000 + i as u16,
        app_port: 10000 + i as u16,
        priority,
        delegate_ip: String::new(),
    }
}

fn node_config(i: usize, priorities: &[i16], consensus: votemgr::Config) -> Config {
    let peers = (0..priorities.len())
        .filter(|j| *j != i)
        .map(|j| PeerConfig {
            profile: profile(j, priorities[j]),
            addr: listen_addr(j),
        })
        .collect();

    Config {
        local: profile(i, priorities[i]),
        peers,
        auth_key: None,
        consensus,
        escalation: escalation::Config::default(),
        exit_on_network_trouble: false,
    }
}

/// A cluster of state machines joined by a lossless in-memory network.
struct Cluster {
    machines: Vec<StateMachine<RefClock>>,
    clock: RefClock,
    /// Established links, as `(dialer, acceptor)` pairs.
    links: HashSet<(usize, usize)>,
    /// Pairs that cannot talk, as `(dialer, acceptor)`.
    blocked: HashSet<(usize, usize)>,
    /// Events published by each machine.
    events: Vec<Vec<Event>>,
}

impl Cluster {
    fn new(priorities: &[i16]) -> Self {
        Self::with_consensus(priorities, |_| votemgr::Config::default())
    }

    fn with_consensus(priorities: &[i16], consensus: impl Fn(usize) -> votemgr::Config) -> Self {
        let clock = RefClock::new(LocalTime::from_secs(1_000));
        let machines = (0..priorities.len())
            .map(|i| {
                StateMachine::new(
                    node_config(i, priorities, consensus(i)),
                    Box::new(ManualLinkMonitor::healthy("10.0.0.1".parse().unwrap())),
                    clock.clone(),
                )
            })
            .collect::<Vec<_>>();
        let events = (0..priorities.len()).map(|_| Vec::new()).collect();

        Self {
            machines,
            clock,
            links: HashSet::new(),
            blocked: HashSet::new(),
            events,
        }
    }

    fn start(&mut self) {
        let now = self.clock.local_time();

        for machine in self.machines.iter_mut() {
            machine.initialize(now);
        }
        self.settle();
    }

    /// The node a destination address belongs to, from the sender's point
    /// of view, together with the source address the receiver sees.
    fn route(&self, from: usize, dest: SocketAddr) -> Option<(usize, SocketAddr)> {
        for j in 0..self.machines.len() {
            if dest == listen_addr(j) {
                // Traffic on `from`'s dialed connection to `j`.
                return Some((j, inbound_addr(from, j)));
            }
            if dest == inbound_addr(j, from) {
                // Traffic back over the connection `j` dialed to `from`.
                return Some((j, listen_addr(from)));
            }
        }
        None
    }

    /// Process queued outputs until the whole cluster goes quiet.
    fn settle(&mut self) {
        loop {
            let mut worked = false;

            for i in 0..self.machines.len() {
                while let Some(io) = self.machines[i].next() {
                    worked = true;
                    self.process(i, io);
                }
            }
            if !worked {
                break;
            }
        }
    }

    fn process(&mut self, i: usize, io: Io) {
        match io {
            Io::Connect(dest) => {
                let Some(j) = (0..self.machines.len()).find(|j| listen_addr(*j) == dest) else {
                    return;
                };

                if self.blocked.contains(&(i, j)) {
                    let err = Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
                    self.machines[i].disconnected(&dest, Disconnect::DialError(err));
                    return;
                }
                if !self.links.insert((i, j)) {
                    return;
                }

                let local = listen_addr(i);
                self.machines[i].connected(dest, &local, Link::Outbound);
                let peer_side = inbound_addr(i, j);
                self.machines[j].connected(peer_side, &listen_addr(j), Link::Inbound);
            }
            Io::Write(dest, packet) => {
                let Some((j, src)) = self.route(i, dest) else {
                    return;
                };
                let delivered = match (dest == listen_addr(j), self.links.contains(&(i, j))) {
                    // Over our dialed link.
                    (true, up) => up,
                    // Over the link the peer dialed.
                    (false, _) => self.links.contains(&(j, i)),
                };

                if delivered {
                    self.machines[j].packet_received(&src, packet);
                }
            }
            Io::Disconnect(addr, reason) => {
                let Some((j, peer_addr)) = self.route(i, addr) else {
                    return;
                };

                if addr == listen_addr(j) {
                    self.links.remove(&(i, j));
                } else {
                    self.links.remove(&(j, i));
                }
                self.machines[i].disconnected(&addr, Disconnect::StateMachine(reason));
                let err = Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
                self.machines[j].disconnected(&peer_addr, Disconnect::ConnectionError(err));
            }
            Io::SetTimer(_) => {}
            Io::Event(event) => self.events[i].push(event),
        }
    }

    /// Advance the cluster by whole seconds, ticking every machine.
    fn elapse(&mut self, secs: u64) {
        for _ in 0..secs {
            self.clock.elapse(LocalDuration::from_secs(1));
            for machine in self.machines.iter_mut() {
                machine.tick();
            }
            self.settle();
        }
    }

    /// Cut both directions between two nodes.
    fn partition(&mut self, a: usize, b: usize) {
        self.blocked.insert((a, b));
        self.blocked.insert((b, a));

        for (dialer, acceptor) in [(a, b), (b, a)] {
            if self.links.remove(&(dialer, acceptor)) {
                let err = Arc::new(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
                self.machines[dialer].disconnected(
                    &listen_addr(acceptor),
                    Disconnect::ConnectionError(err.clone()),
                );
                self.machines[acceptor].disconnected(
                    &inbound_addr(dialer, acceptor),
                    Disconnect::ConnectionError(err),
                );
            }
        }
        self.settle();
    }

    fn heal(&mut self, a: usize, b: usize) {
        self.blocked.remove(&(a, b));
        self.blocked.remove(&(b, a));
    }

    fn states(&self) -> Vec<NodeState> {
        self.machines.iter().map(|m| m.state()).collect()
    }

    fn coordinator_count(&self) -> usize {
        self.machines
            .iter()
            .filter(|m| m.state() == NodeState::Coordinator)
            .count()
    }
}

/// Three nodes starting together elect the highest priority as coordinator
/// and everyone else follows it as standby.
#[test]
fn three_node_election() {
    let mut cluster = Cluster::new(&[3, 2, 1]);

    cluster.start();
    cluster.elapse(10);

    assert_eq!(
        cluster.states(),
        vec![NodeState::Coordinator, NodeState::Standby, NodeState::Standby]
    );
    assert_eq!(cluster.machines[0].master(), ClusterMaster::Local);
    assert_eq!(cluster.machines[1].master(), ClusterMaster::Remote(1));
    assert_eq!(cluster.machines[0].my_snapshot().standby_count, 2);
    assert!(cluster.machines[0].quorum_status() >= 0);
    assert!(cluster.machines[0].escalated());
}

/// Equal priorities: the node with the older startup time wins.
#[test]
fn priority_tie_goes_to_the_older_node() {
    let clock = RefClock::new(LocalTime::from_secs(1_000));
    let priorities = [2, 2];
    let machine_a = StateMachine::new(
        node_config(0, &priorities, votemgr::Config::default()),
        Box::new(ManualLinkMonitor::healthy("10.0.0.1".parse().unwrap())),
        clock.clone(),
    );

    // Node B starts ten seconds later.
    clock.elapse(LocalDuration::from_secs(10));
    let machine_b = StateMachine::new(
        node_config(1, &priorities, votemgr::Config::default()),
        Box::new(ManualLinkMonitor::healthy("10.0.0.2".parse().unwrap())),
        clock.clone(),
    );

    let mut cluster = Cluster {
        machines: vec![machine_a, machine_b],
        clock,
        links: HashSet::new(),
        blocked: HashSet::new(),
        events: vec![Vec::new(), Vec::new()],
    };

    cluster.start();
    cluster.elapse(10);

    assert_eq!(
        cluster.states(),
        vec![NodeState::Coordinator, NodeState::Standby]
    );
}

/// After a steady-state interval with no network events, exactly one node
/// is coordinator and the others are standbys.
#[test]
fn at_most_one_coordinator_in_steady_state() {
    let mut cluster = Cluster::new(&[1, 2, 3, 4]);

    cluster.start();
    cluster.elapse(30);

    assert_eq!(cluster.coordinator_count(), 1);
    assert_eq!(
        cluster
            .states()
            .iter()
            .filter(|s| **s == NodeState::Standby)
            .count(),
        3
    );

    // Another quiet interval changes nothing.
    cluster.elapse(30);
    assert_eq!(cluster.coordinator_count(), 1);
}

/// Split-brain healed by the worthiness tiebreak: the escalated side keeps
/// the coordinatorship, the other re-joins.
#[test]
fn split_brain_resolves_toward_the_escalated_node() {
    // Node B accepts half votes, so its singleton cluster reaches quorum 0
    // and escalates; node A stays at quorum -1.
    let mut cluster = Cluster::with_consensus(&[2, 1], |i| votemgr::Config {
        enable_consensus_with_half_votes: i == 1,
        ..votemgr::Config::default()
    });

    cluster.partition(0, 1);
    cluster.start();
    cluster.elapse(15);

    assert_eq!(cluster.coordinator_count(), 2);
    assert!(!cluster.machines[0].escalated());
    assert!(cluster.machines[1].escalated());

    cluster.heal(0, 1);
    cluster.elapse(320);

    // A stepped down despite its higher priority; B keeps the VIP.
    assert_eq!(cluster.machines[1].state(), NodeState::Coordinator);
    assert!(cluster.machines[1].escalated());
    assert_eq!(cluster.machines[0].state(), NodeState::Standby);
    assert_eq!(cluster.machines[0].master(), ClusterMaster::Remote(1));
    assert_eq!(cluster.coordinator_count(), 1);
    assert!(cluster.events[0]
        .iter()
        .any(|e| matches!(e, Event::SplitBrainDetected { .. })));
}

/// A lost coordinator triggers a re-election among the survivors.
#[test]
fn coordinator_loss_reelects() {
    let mut cluster = Cluster::new(&[3, 2, 1]);

    cluster.start();
    cluster.elapse(10);
    assert_eq!(cluster.machines[0].state(), NodeState::Coordinator);

    cluster.partition(0, 1);
    cluster.partition(0, 2);
    cluster.elapse(30);

    // The higher-priority survivor takes over.
    assert_eq!(cluster.machines[1].state(), NodeState::Coordinator);
    assert_eq!(cluster.machines[2].state(), NodeState::Standby);
}

/// Failover consensus in a four-node cluster: two remote votes plus the
/// coordinator's own reach the three-vote minimum.
#[test]
fn failover_consensus_with_four_nodes() {
    let mut cluster = Cluster::new(&[4, 3, 2, 1]);

    cluster.start();
    cluster.elapse(10);
    assert_eq!(cluster.machines[0].state(), NodeState::Coordinator);

    let vote = |command_id: u32| {
        Packet::with_json(
            MessageType::FailoverRequest,
            command_id,
            &FailoverRequestPayload {
                kind: FailoverKind::NodeDown,
                node_ids: vec![0],
                flags: 0,
            },
        )
    };

    // Votes from standbys 1 and 2 arrive on the coordinator's links.
    cluster.machines[0].packet_received(&inbound_addr(1, 0), vote(801));
    cluster.machines[0].packet_received(&inbound_addr(2, 0), vote(802));

    // Two votes are not enough for N=4.
    let (reply_tx, reply_rx) = chan::bounded::<IpcResponse>(1);
    cluster.machines[0].command(Command::Failover {
        kind: FailoverKind::NodeDown,
        node_ids: vec![0],
        flags: 0,
        reply: reply_tx,
    });
    let response = reply_rx.try_recv().unwrap();

    assert_eq!(response.ty, IpcResultType::Ok);
    assert_eq!(response.body["FailoverResult"], "Proceed");
}

/// With a single requestor the proposal keeps building consensus.
#[test]
fn failover_without_consensus_keeps_waiting() {
    let mut cluster = Cluster::new(&[4, 3, 2, 1]);

    cluster.start();
    cluster.elapse(10);

    cluster.machines[0].packet_received(
        &inbound_addr(1, 0),
        Packet::with_json(
            MessageType::FailoverRequest,
            801,
            &FailoverRequestPayload {
                kind: FailoverKind::NodeDown,
                node_ids: vec![0],
                flags: 0,
            },
        ),
    );

    let (reply_tx, reply_rx) = chan::bounded::<IpcResponse>(1);
    cluster.machines[0].command(Command::Failover {
        kind: FailoverKind::NodeDown,
        node_ids: vec![0],
        flags: 0,
        reply: reply_tx,
    });
    let response = reply_rx.try_recv().unwrap();

    assert_eq!(response.body["FailoverResult"], "BuildingConsensus");
}

/// A coordinator whose own node-down vote for a quarantined primary
/// expires without consensus lowers its priority and resigns.
#[test]
fn stale_proposal_resignation() {
    let mut cluster = Cluster::new(&[4, 3, 2, 1]);

    cluster.start();
    cluster.elapse(10);
    assert_eq!(cluster.machines[0].state(), NodeState::Coordinator);

    // The middleware quarantined its primary backend.
    cluster.machines[0].command(Command::FailoverIndication {
        phase: FailoverPhase::Start,
        primary_quarantined: true,
    });
    cluster.settle();

    // Our own vote cannot reach consensus alone.
    let (reply_tx, reply_rx) = chan::bounded::<IpcResponse>(1);
    cluster.machines[0].command(Command::Failover {
        kind: FailoverKind::NodeDown,
        node_ids: vec![0],
        flags: 0,
        reply: reply_tx,
    });
    assert_eq!(
        reply_rx.try_recv().unwrap().body["FailoverResult"],
        "BuildingConsensus"
    );

    cluster.elapse(16);

    // The proposal expired: the coordinator lowered its priority and
    // stepped down.
    assert_ne!(cluster.machines[0].state(), NodeState::Coordinator);
    assert_eq!(cluster.machines[0].local.priority, -1);
    assert_ne!(cluster.machines[0].master(), ClusterMaster::Local);

    // The cluster re-elects around the resigned node.
    cluster.elapse(15);
    assert_eq!(cluster.machines[1].state(), NodeState::Coordinator);
}

/// A standby that stops hearing from its coordinator rejoins the cluster.
#[test]
fn silent_coordinator_is_abandoned() {
    let mut cluster = Cluster::new(&[2, 1]);

    cluster.start();
    cluster.elapse(10);
    assert_eq!(cluster.machines[1].state(), NodeState::Standby);

    // Swallow all traffic without tearing connections down.
    cluster.blocked.insert((0, 1));
    cluster.blocked.insert((1, 0));
    let links = cluster.links.clone();
    cluster.links.clear();

    cluster.elapse(21);
    cluster.links = links;

    assert_ne!(cluster.machines[1].state(), NodeState::Standby);
}

/// A clean shutdown announcement moves the peer to `Shutdown`, not `Lost`.
#[test]
fn clean_shutdown_is_not_a_loss() {
    let mut cluster = Cluster::new(&[2, 1]);

    cluster.start();
    cluster.elapse(10);

    cluster.machines[0].packet_received(
        &inbound_addr(1, 0),
        Packet::minimal(MessageType::InformIamGoingDown, 900),
    );
    cluster.settle();

    let peer = cluster.machines[0].peers().get(1).unwrap();
    assert_eq!(peer.state, NodeState::Shutdown);
}
