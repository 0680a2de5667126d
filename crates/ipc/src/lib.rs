//! Local IPC surface of the watchdog: a unix stream socket through which
//! the middleware and its CLI tools submit commands and subscribe to
//! cluster notifications.

mod auth;
mod server;

pub use auth::authenticate;
pub use server::{IpcConfig, IpcServer};

use thiserror::Error;

/// IPC server errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Binding or accepting on the socket failed.
    #[error("ipc socket error: {0}")]
    Io(#[from] std::io::Error),
}
