use serde::Deserialize;
use std::path::PathBuf;

/// Local IPC socket placement.
#[derive(Deserialize, Clone)]
pub struct IpcSocketConfig {
    /// Directory the command socket is created in.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Default for IpcSocketConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
        }
    }
}
