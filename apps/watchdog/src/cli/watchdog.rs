use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::Context;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use pgward_ipc::{IpcConfig, IpcServer};
use pgward_watchdog::client::handle::Handle as _;
use pgward_watchdog::client::{WatchdogClient, WatchdogConfig};
use pgward_watchdog::fsm::event::Event;
use pgward_watchdog::fsm::handler;
use pgward_watchdog::fsm::ifmgr::SystemLinkMonitor;

use crate::config::WatchdogdConfig;

/// The limit of time to wait for the watchdog to shut down.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Wires the watchdog client and the IPC server together and runs them.
pub struct Watchdog {
    config: WatchdogdConfig,
    cancellation: CancellationToken,
    fatal: Arc<AtomicBool>,
    handle: pgward_watchdog::client::Handle<pgward_watchdog::net::Waker>,
    client: std::sync::Mutex<Option<WatchdogClient>>,
    events: flume::Receiver<Event>,
    task_tracker: TaskTracker,
}

impl Watchdog {
    pub fn new(config: WatchdogdConfig) -> eyre::Result<Self> {
        let machine = handler::Config {
            local: config.cluster.local_profile(),
            peers: config.cluster.peer_configs()?,
            auth_key: config.cluster.auth_key.clone(),
            consensus: config.consensus.to_vote_config(),
            escalation: config.escalation.to_escalation_config(),
            exit_on_network_trouble: config.exit_on_network_trouble,
        };
        let client_config = WatchdogConfig {
            listen: config.cluster.listen_addr()?,
            machine,
        };

        let client = WatchdogClient::new(client_config, Box::new(SystemLinkMonitor::new()))
            .wrap_err("Failed to create the watchdog client")?;
        let handle = client.handle();
        let events = client.events();

        Ok(Self {
            config,
            cancellation: CancellationToken::new(),
            fatal: Arc::new(AtomicBool::new(false)),
            handle,
            client: std::sync::Mutex::new(Some(client)),
            events,
            task_tracker: TaskTracker::new(),
        })
    }

    /// Wait for any of the watchdog's services to signal cancellation.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Whether the watchdog stopped on a fatal condition.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub async fn run(&self) -> eyre::Result<()> {
        let client = self
            .client
            .lock()
            .expect("client mutex")
            .take()
            .expect("run is called once");

        self.task_tracker.spawn(client.run(self.cancellation.clone()));

        // Pump cluster events: fatal conditions stop the process, the rest
        // feed the IPC notification list.
        let (notify_tx, notify_rx) = flume::unbounded();
        let events = self.events.clone();
        let cancellation = self.cancellation.clone();
        let fatal = self.fatal.clone();

        self.task_tracker.spawn(async move {
            while let Ok(event) = events.recv_async().await {
                if let Event::Fatal { reason } = &event {
                    error!("Watchdog hit a fatal condition: {}", reason);
                    fatal.store(true, Ordering::SeqCst);
                    cancellation.cancel();
                }
                notify_tx.send(event).ok();
            }
        });

        let ipc_config = IpcConfig {
            socket_dir: self.config.ipc.socket_dir.clone(),
            wd_port: self.config.cluster.node.wd_port,
            auth_key: self.config.cluster.auth_key.clone(),
            shared_key: fastrand::u32(1..),
        };
        let ipc = IpcServer::new(ipc_config, self.handle.clone(), notify_rx);
        let cancellation = self.cancellation.clone();

        self.task_tracker.spawn(async move {
            if let Err(err) = ipc.run(cancellation.clone()).await {
                error!("IPC server is down: {}", err);
                cancellation.cancel();
            }
        });

        self.task_tracker.close();

        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down the watchdog");

        // Tell the cluster we are leaving and release the VIP before the
        // reactor goes away.
        self.handle.shutdown().await.ok();
        sleep(Duration::from_millis(200)).await;

        self.cancellation.cancel();

        let timeout = self
            .config
            .shutdown_timeout
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        tokio::select! {
            _ = self.task_tracker.wait() => {}
            _ = sleep(Duration::from_secs(timeout)) => {
                error!("Watchdog services did not stop in time");
            }
        }
    }
}
