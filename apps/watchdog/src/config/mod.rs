use config::Config;
use serde::Deserialize;

use std::path::PathBuf;

mod cluster;
pub use cluster::{ClusterConfig, NodeEntry};

mod consensus;
pub use consensus::ConsensusConfig;

mod escalation;
pub use escalation::EscalationConfig;

mod ipc;
pub use ipc::IpcSocketConfig;

#[derive(Deserialize)]
pub struct WatchdogdConfig {
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub ipc: IpcSocketConfig,

    /// Log verbosity: trace, debug, info, warn or error. Individual targets
    /// can still be tuned through `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Exit (without restart) on a total network blackout. An isolated
    /// node otherwise accumulates a backend view the cluster won't share.
    #[serde(default = "default_exit_on_network_trouble")]
    pub exit_on_network_trouble: bool,

    #[serde(default)]
    pub shutdown_timeout: Option<u64>,
}

fn default_exit_on_network_trouble() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

impl WatchdogdConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
