//! The watchdog client: wires the state machine, the reactor and the
//! command channel together.

use std::net::SocketAddr;

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;
use tracing::error;

use pgward_types::consensus::FailoverKind;
use pgward_types::ipc::{
    FailoverPhase, IpcResponse, NodeStatus, NodesListResponse, RuntimeValue, RuntimeVariable,
};
use pgward_types::messages::RecoveryPhase;
use pgward_types::node::NodeId;

use crate::client::handle;
use crate::client::service::Service;
use crate::client::Error;
use crate::fsm::event::Event;
use crate::fsm::handler::{self, Command};
use crate::fsm::ifmgr::LinkMonitor;
use crate::net::reactor::{Reactor, Waker};
use crate::net::{LocalTime, NetWaker, RefClock};

/// Watchdog client configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Address to listen for peer connections on.
    pub listen: SocketAddr,
    /// State machine configuration.
    pub machine: handler::Config,
}

/// Runs a pre-loaded watchdog client.
pub struct WatchdogClient {
    handle: Handle<Waker>,
    service: Service,
    listen: SocketAddr,
    commands: chan::Receiver<Command>,
    events_tx: chan::Sender<Event>,
    events_rx: chan::Receiver<Event>,
    reactor: Reactor,
}

impl WatchdogClient {
    /// Create a new client.
    pub fn new(
        config: WatchdogConfig,
        ifmon: Box<dyn LinkMonitor + Send>,
    ) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();
        let (listening_tx, listening_rx) = chan::bounded(1);
        let (events_tx, events_rx) = chan::unbounded();

        let reactor = Reactor::new(listening_tx)?;
        let clock = RefClock::new(LocalTime::now());
        let service = Service::new(config.machine, ifmon, clock);

        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            listening: listening_rx,
        };

        Ok(WatchdogClient {
            handle,
            service,
            listen: config.listen,
            commands: commands_rx,
            events_tx,
            events_rx,
            reactor,
        })
    }

    /// Create a new handle to communicate with the client.
    pub fn handle(&self) -> Handle<Waker> {
        self.handle.clone()
    }

    /// The cluster event stream. Every event the state machine publishes
    /// lands here exactly once.
    pub fn events(&self) -> chan::Receiver<Event> {
        self.events_rx.clone()
    }

    /// Run the client until cancelled.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let result = self
            .reactor
            .run(
                &self.listen,
                self.service,
                self.commands,
                self.events_tx,
                cancellation,
            )
            .await;

        if let Err(e) = result {
            error!(target: "wd", "watchdog networking is down: {}", e);
        }
    }
}

/// A cloneable handle to the running client.
#[derive(Clone)]
pub struct Handle<W: NetWaker> {
    pub commands: chan::Sender<Command>,
    pub waker: W,
    pub listening: chan::Receiver<SocketAddr>,
}

impl<W: NetWaker> Handle<W> {
    /// Send a command to the command channel, and wake up the event loop.
    async fn command(&self, cmd: Command) -> Result<(), Error> {
        if self.commands.send_async(cmd).await.is_err() {
            return Err(Error::Command);
        }
        self.waker.wake()?;

        Ok(())
    }
}

#[async_trait]
impl<W: NetWaker> handle::Handle for Handle<W> {
    async fn failover(
        &self,
        kind: FailoverKind,
        node_ids: Vec<i32>,
        flags: u8,
    ) -> Result<IpcResponse, Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Failover {
            kind,
            node_ids,
            flags,
            reply: transmit,
        })
        .await?;

        receive.recv_async().await.map_err(|_| Error::Timeout)
    }

    async fn online_recovery(
        &self,
        phase: RecoveryPhase,
        node_id: i32,
    ) -> Result<IpcResponse, Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::OnlineRecovery {
            phase,
            node_id,
            reply: transmit,
        })
        .await?;

        receive.recv_async().await.map_err(|_| Error::Timeout)
    }

    async fn nodes_list(&self) -> Result<NodesListResponse, Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetNodesList { reply: transmit }).await?;

        receive.recv_async().await.map_err(|_| Error::Timeout)
    }

    async fn runtime_variable(&self, name: RuntimeVariable) -> Result<RuntimeValue, Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetRuntimeVariable {
            name,
            reply: transmit,
        })
        .await?;

        receive.recv_async().await.map_err(|_| Error::Timeout)
    }

    async fn node_status_change(&self, node_id: NodeId, status: NodeStatus) -> Result<(), Error> {
        self.command(Command::NodeStatusChange { node_id, status })
            .await
    }

    async fn failover_indication(
        &self,
        phase: FailoverPhase,
        primary_quarantined: bool,
    ) -> Result<(), Error> {
        self.command(Command::FailoverIndication {
            phase,
            primary_quarantined,
        })
        .await
    }

    async fn master_data(&self) -> Result<IpcResponse, Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetMasterData { reply: transmit }).await?;

        receive.recv_async().await.map_err(|_| Error::Timeout)
    }

    async fn shutdown(&self) -> Result<(), Error> {
        self.command(Command::Shutdown).await
    }
}
