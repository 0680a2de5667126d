//! Shared types of the pgward watchdog: the node model, the inter-watchdog
//! wire protocol and the local IPC protocol.

pub mod consensus;
pub mod ipc;
pub mod messages;
pub mod node;

pub use consensus::{request_flags, FailoverKind, FailoverResult};
pub use messages::{ClusterServiceCode, DecodeError, MessageType, Packet};
pub use node::{NodeId, NodeProfile, NodeSnapshot, NodeState, LOCAL_NODE_ID};
