//! Failover consensus types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a backend failover request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailoverKind {
    /// Reattach a backend (failback).
    NodeUp,
    /// Detach a failed backend.
    NodeDown,
    /// Promote a standby backend to primary.
    NodePromote,
}

impl fmt::Display for FailoverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeUp => write!(f, "node up"),
            Self::NodeDown => write!(f, "node down"),
            Self::NodePromote => write!(f, "node promote"),
        }
    }
}

/// Bit flags attached to a failover request.
pub mod request_flags {
    /// The requester has already confirmed the failure; bypass quorum and
    /// consensus checks.
    pub const CONFIRMED: u8 = 0x01;
    /// The request was (re-)issued by the watchdog itself after consensus.
    pub const WATCHDOG: u8 = 0x02;
}

/// Outcome of a failover request, surfaced to the requesting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverResult {
    /// The caller may execute the failover itself.
    Proceed,
    /// The coordinator took over execution on behalf of a remote requester.
    WillBeDone,
    /// The cluster does not hold the quorum.
    NoQuorum,
    /// The vote was recorded; more votes are needed.
    BuildingConsensus,
    /// Duplicate vote that cannot count; consensus may never build.
    ConsensusMayFail,
    /// The request could not be parsed or names an unknown operation.
    InvalidRequest,
    /// Processing failed.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_json_roundtrip() {
        for kind in [
            FailoverKind::NodeUp,
            FailoverKind::NodeDown,
            FailoverKind::NodePromote,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let parsed: FailoverKind = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
