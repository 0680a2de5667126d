//! Local IPC protocol between the middleware (and its CLI tools) and the
//! watchdog.
//!
//! Frames are `type(1) | length(u32 BE) | payload`, payloads are JSON
//! objects. Every request body may carry the process-internal shared key or
//! the configured auth key.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::{FailoverKind, FailoverResult};
use crate::messages::MAX_PAYLOAD_LEN;
use crate::node::{NodeId, NodeState};

/// Size of the fixed IPC frame header.
pub const HEADER_LEN: usize = 1 + 4;

/// IPC request type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpcCommandType {
    /// Inject a node liveness change reported by the lifecheck.
    NodeStatusChange,
    /// Keep this socket and push every subsequent cluster transition to it.
    RegisterForNotification,
    /// Enumerate all watchdog nodes (local + remote).
    GetNodesList,
    /// Read one runtime variable.
    GetRuntimeVariable,
    /// Submit a backend failover request (enters the consensus engine).
    FailoverCommand,
    /// Begin/end an online recovery across the cluster.
    OnlineRecoveryCommand,
    /// The middleware signals the start or end of an executing failover.
    FailoverIndication,
    /// Fetch the coordinator's cluster view (forwarded when standby).
    GetMasterData,
}

impl IpcCommandType {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::NodeStatusChange => b's',
            Self::RegisterForNotification => b'r',
            Self::GetNodesList => b'l',
            Self::GetRuntimeVariable => b'v',
            Self::FailoverCommand => b'f',
            Self::OnlineRecoveryCommand => b'o',
            Self::FailoverIndication => b'i',
            Self::GetMasterData => b'd',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b's' => Self::NodeStatusChange,
            b'r' => Self::RegisterForNotification,
            b'l' => Self::GetNodesList,
            b'v' => Self::GetRuntimeVariable,
            b'f' => Self::FailoverCommand,
            b'o' => Self::OnlineRecoveryCommand,
            b'i' => Self::FailoverIndication,
            b'd' => Self::GetMasterData,
            _ => return None,
        })
    }

    /// Commands only the middleware process itself may issue. These demand
    /// the process shared key; everything else also accepts the configured
    /// auth key.
    pub fn is_internal_only(&self) -> bool {
        matches!(
            self,
            Self::FailoverCommand | Self::OnlineRecoveryCommand | Self::GetMasterData
        )
    }
}

/// IPC result type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcResultType {
    Ok,
    Bad,
    ClusterInTransition,
    Timeout,
}

impl IpcResultType {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Ok => b'k',
            Self::Bad => b'b',
            Self::ClusterInTransition => b't',
            Self::Timeout => b'x',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'k' => Self::Ok,
            b'b' => Self::Bad,
            b't' => Self::ClusterInTransition,
            b'x' => Self::Timeout,
            _ => return None,
        })
    }
}

/// Failure to decode an IPC frame.
#[derive(Error, Debug)]
pub enum IpcDecodeError {
    #[error("unknown ipc frame type byte {0:#04x}")]
    UnknownType(u8),

    #[error("ipc payload length {0} exceeds the limit of {MAX_PAYLOAD_LEN} bytes")]
    OversizedPayload(usize),

    #[error("malformed json payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Encode an IPC frame.
pub fn encode_frame(ty: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());

    buf.push(ty);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode one IPC frame from the front of `bytes`.
///
/// Returns the raw type byte, the payload, and the number of bytes
/// consumed, or `Ok(None)` when more bytes are needed.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(u8, Vec<u8>, usize)>, IpcDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Ok(None);
    }

    let ty = bytes[0];
    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;

    if len > MAX_PAYLOAD_LEN {
        return Err(IpcDecodeError::OversizedPayload(len));
    }
    if bytes.len() < HEADER_LEN + len {
        return Ok(None);
    }

    Ok(Some((
        ty,
        bytes[HEADER_LEN..HEADER_LEN + len].to_vec(),
        HEADER_LEN + len,
    )))
}

/// Credentials optionally present in every IPC request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcCredentials {
    #[serde(rename = "IPCSharedKey", default, skip_serializing_if = "Option::is_none")]
    pub shared_key: Option<u32>,
    #[serde(rename = "IPCAuthKey", default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
}

/// Liveness value carried by a [`NodeStatusChangeRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Alive,
    Dead,
}

/// Body of `NodeStatusChange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatusChangeRequest {
    #[serde(flatten)]
    pub credentials: IpcCredentials,
    /// 0 is the local node, remote peers use their stable ids.
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    #[serde(rename = "NodeStatus")]
    pub status: NodeStatus,
    #[serde(rename = "Message", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Runtime variables readable over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeVariable {
    WdState,
    QuorumState,
    EscalationState,
}

/// Body of `GetRuntimeVariable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeVariableRequest {
    #[serde(flatten)]
    pub credentials: IpcCredentials,
    #[serde(rename = "VarName")]
    pub name: RuntimeVariable,
}

/// Value of a runtime variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuntimeValue {
    State(NodeState),
    Int(i64),
    Bool(bool),
}

/// Body of `FailoverCommand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverIpcRequest {
    #[serde(flatten)]
    pub credentials: IpcCredentials,
    #[serde(rename = "Kind")]
    pub kind: FailoverKind,
    #[serde(rename = "NodeIdList")]
    pub node_ids: Vec<i32>,
    #[serde(rename = "Flags", default)]
    pub flags: u8,
}

/// Reply body of `FailoverCommand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverIpcResponse {
    #[serde(rename = "FailoverResult")]
    pub result: FailoverResult,
}

/// Phase of an ongoing failover, reported by the middleware main process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverPhase {
    Start,
    End,
}

/// Body of `FailoverIndication`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverIndicationRequest {
    #[serde(flatten)]
    pub credentials: IpcCredentials,
    #[serde(rename = "Phase")]
    pub phase: FailoverPhase,
    /// Set when the middleware has quarantined its primary backend; feeds
    /// the coordinator's stale-proposal resignation rule.
    #[serde(rename = "PrimaryQuarantined", default)]
    pub primary_quarantined: bool,
}

pub use crate::messages::RecoveryPhase;

/// Body of `OnlineRecoveryCommand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineRecoveryRequest {
    #[serde(flatten)]
    pub credentials: IpcCredentials,
    #[serde(rename = "Phase")]
    pub phase: RecoveryPhase,
    #[serde(rename = "NodeID", default)]
    pub node_id: i32,
}

/// One node in a `GetNodesList` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesListEntry {
    #[serde(rename = "ID")]
    pub id: NodeId,
    #[serde(rename = "NodeName")]
    pub name: String,
    #[serde(rename = "HostName")]
    pub host: String,
    #[serde(rename = "WdPort")]
    pub wd_port: u16,
    #[serde(rename = "AppPort")]
    pub app_port: u16,
    #[serde(rename = "Priority")]
    pub priority: i16,
    #[serde(rename = "State")]
    pub state: NodeState,
    #[serde(rename = "StateName")]
    pub state_name: String,
    #[serde(rename = "DelegateIP")]
    pub delegate_ip: String,
}

/// Reply body of `GetNodesList`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesListResponse {
    #[serde(rename = "NodeCount")]
    pub node_count: u32,
    #[serde(rename = "WatchdogNodes")]
    pub nodes: Vec<NodesListEntry>,
}

/// A completed IPC exchange: result type plus JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcResponse {
    pub ty: IpcResultType,
    pub body: serde_json::Value,
}

impl IpcResponse {
    pub fn ok<T: Serialize>(body: &T) -> Self {
        Self {
            ty: IpcResultType::Ok,
            body: serde_json::to_value(body).expect("response serialization cannot fail"),
        }
    }

    pub fn bad(error: impl Into<String>) -> Self {
        Self {
            ty: IpcResultType::Bad,
            body: serde_json::json!({ "Error": error.into() }),
        }
    }

    pub fn in_transition() -> Self {
        Self {
            ty: IpcResultType::ClusterInTransition,
            body: serde_json::json!({ "Error": "cluster is in transition" }),
        }
    }

    pub fn timeout() -> Self {
        Self {
            ty: IpcResultType::Timeout,
            body: serde_json::json!({ "Error": "command timed out" }),
        }
    }

    /// Encode as a result frame.
    pub fn encode(&self) -> Vec<u8> {
        let body = serde_json::to_vec(&self.body).expect("json value always serializes");
        encode_frame(self.ty.to_byte(), &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let body = serde_json::to_vec(&RuntimeVariableRequest {
            credentials: IpcCredentials::default(),
            name: RuntimeVariable::WdState,
        })
        .unwrap();
        let frame = encode_frame(IpcCommandType::GetRuntimeVariable.to_byte(), &body);

        let (ty, payload, used) = decode_frame(&frame).unwrap().unwrap();

        assert_eq!(used, frame.len());
        assert_eq!(IpcCommandType::from_byte(ty), Some(IpcCommandType::GetRuntimeVariable));
        let parsed: RuntimeVariableRequest = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed.name, RuntimeVariable::WdState);
    }

    #[test]
    fn short_frame_asks_for_more() {
        let frame = encode_frame(b'l', br#"{"NodeID": -1}"#);
        for cut in 0..frame.len() {
            assert!(matches!(decode_frame(&frame[..cut]), Ok(None)));
        }
    }

    #[test]
    fn credentials_flatten_into_request_body() {
        let request = FailoverIpcRequest {
            credentials: IpcCredentials {
                shared_key: Some(12345),
                auth_key: None,
            },
            kind: FailoverKind::NodeDown,
            node_ids: vec![0],
            flags: 0,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["IPCSharedKey"], 12345);
        assert!(value.get("IPCAuthKey").is_none());

        let parsed: FailoverIpcRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn internal_only_commands() {
        assert!(IpcCommandType::FailoverCommand.is_internal_only());
        assert!(IpcCommandType::GetMasterData.is_internal_only());
        assert!(!IpcCommandType::GetNodesList.is_internal_only());
        assert!(!IpcCommandType::RegisterForNotification.is_internal_only());
    }
}
