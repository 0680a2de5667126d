//! Inter-watchdog wire protocol.
//!
//! Every message travels as `type(1) | command_id(u32 BE) | length(u32 BE) |
//! payload`. The single-byte type codes are a stable ABI; structured
//! payloads are JSON objects so a capture is always human-readable.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::FailoverKind;

/// Upper bound on a payload we are willing to parse.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 1 + 4 + 4;

/// Message type codes of the watchdog mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Membership handshake; payload is the sender's [`NodeSnapshot`].
    AddNode,
    /// State snapshot; payload is a [`NodeSnapshot`]. Reply to `AddNode`,
    /// `RequestInfo` and the coordinator beacon.
    Info,
    /// Ask a node (or all nodes) to send a fresh `Info`.
    RequestInfo,
    /// Contest the coordinatorship.
    StandForCoordinator,
    /// Election won, announcing coordinatorship.
    DeclareCoordinator,
    /// Standby asking the coordinator to be admitted.
    JoinCoordinator,
    /// Coordinator beacon; payload is a [`BeaconPayload`].
    IAmCoordinator,
    /// Generic positive reply.
    Accept,
    /// Generic negative reply.
    Reject,
    /// Generic error reply.
    Error,
    /// Generic data carrier; payload is a [`DataRequest`].
    Data,
    /// Reply to a replicated command, payload carries the result JSON.
    CmdReplyInData,
    /// Replicated failover vote; payload is a [`FailoverRequestPayload`].
    FailoverRequest,
    /// Coordinator signal that a failover began.
    FailoverStart,
    /// Coordinator signal that a failover finished.
    FailoverEnd,
    /// Coordinator is waiting for more failover votes.
    FailoverWaitingForConsensus,
    /// Coordinator asking a standby for its configuration dump.
    AskForPoolConfig,
    /// Configuration dump; payload is a [`PoolConfigPayload`].
    PoolConfigData,
    /// Sender detected a local network blackout.
    IamInNwTrouble,
    /// Clean shutdown announcement.
    InformIamGoingDown,
    /// Sender lost its quorum.
    QuorumIsLost,
    /// Cluster service message; payload is one [`ClusterServiceCode`] byte.
    ClusterService,
}

impl MessageType {
    /// The wire byte of this message type.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::AddNode => b'A',
            Self::RequestInfo => b'B',
            Self::DeclareCoordinator => b'C',
            Self::Data => b'D',
            Self::Error => b'E',
            Self::FailoverStart => b'F',
            Self::Accept => b'G',
            Self::FailoverEnd => b'H',
            Self::Info => b'I',
            Self::JoinCoordinator => b'J',
            Self::FailoverWaitingForConsensus => b'K',
            Self::IAmCoordinator => b'M',
            Self::IamInNwTrouble => b'N',
            Self::QuorumIsLost => b'Q',
            Self::Reject => b'R',
            Self::StandForCoordinator => b'S',
            Self::FailoverRequest => b'V',
            Self::InformIamGoingDown => b'X',
            Self::AskForPoolConfig => b'Y',
            Self::PoolConfigData => b'Z',
            Self::CmdReplyInData => b'-',
            Self::ClusterService => b'#',
        }
    }

    /// Parse a wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'A' => Self::AddNode,
            b'B' => Self::RequestInfo,
            b'C' => Self::DeclareCoordinator,
            b'D' => Self::Data,
            b'E' => Self::Error,
            b'F' => Self::FailoverStart,
            b'G' => Self::Accept,
            b'H' => Self::FailoverEnd,
            b'I' => Self::Info,
            b'J' => Self::JoinCoordinator,
            b'K' => Self::FailoverWaitingForConsensus,
            b'M' => Self::IAmCoordinator,
            b'N' => Self::IamInNwTrouble,
            b'Q' => Self::QuorumIsLost,
            b'R' => Self::Reject,
            b'S' => Self::StandForCoordinator,
            b'V' => Self::FailoverRequest,
            b'X' => Self::InformIamGoingDown,
            b'Y' => Self::AskForPoolConfig,
            b'Z' => Self::PoolConfigData,
            b'-' => Self::CmdReplyInData,
            b'#' => Self::ClusterService,
            _ => return None,
        })
    }

    /// Whether this type is a reply correlated by command id.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::Accept | Self::Reject | Self::Error | Self::Data | Self::CmdReplyInData
        )
    }

    /// All message types, for exhaustive codec tests.
    pub fn all() -> &'static [MessageType] {
        &[
            Self::AddNode,
            Self::RequestInfo,
            Self::DeclareCoordinator,
            Self::Data,
            Self::Error,
            Self::FailoverStart,
            Self::Accept,
            Self::FailoverEnd,
            Self::Info,
            Self::JoinCoordinator,
            Self::FailoverWaitingForConsensus,
            Self::IAmCoordinator,
            Self::IamInNwTrouble,
            Self::QuorumIsLost,
            Self::Reject,
            Self::StandForCoordinator,
            Self::FailoverRequest,
            Self::InformIamGoingDown,
            Self::AskForPoolConfig,
            Self::PoolConfigData,
            Self::CmdReplyInData,
            Self::ClusterService,
        ]
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One-byte sub-codes of [`MessageType::ClusterService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterServiceCode {
    QuorumLost,
    QuorumFound,
    InSplitBrain,
    NeedsElection,
    IamTrueMaster,
    IamNotTrueMaster,
    IamResigningFromMaster,
    NodeInvalidVersion,
}

impl ClusterServiceCode {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::QuorumLost => b'L',
            Self::QuorumFound => b'F',
            Self::InSplitBrain => b'B',
            Self::NeedsElection => b'E',
            Self::IamTrueMaster => b'M',
            Self::IamNotTrueMaster => b'X',
            Self::IamResigningFromMaster => b'R',
            Self::NodeInvalidVersion => b'V',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'L' => Self::QuorumLost,
            b'F' => Self::QuorumFound,
            b'B' => Self::InSplitBrain,
            b'E' => Self::NeedsElection,
            b'M' => Self::IamTrueMaster,
            b'X' => Self::IamNotTrueMaster,
            b'R' => Self::IamResigningFromMaster,
            b'V' => Self::NodeInvalidVersion,
            _ => return None,
        })
    }
}

impl fmt::Display for ClusterServiceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Failure to decode a wire frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Unknown message type byte.
    #[error("unknown message type byte {0:#04x}")]
    UnknownType(u8),

    /// Payload length field exceeds the protocol limit.
    #[error("payload length {0} exceeds the limit of {MAX_PAYLOAD_LEN} bytes")]
    OversizedPayload(usize),

    /// The payload was expected to be JSON and did not parse.
    #[error("malformed json payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A single wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ty: MessageType,
    /// Correlates replies to requests; monotonically increasing per sender
    /// and echoed unchanged on reply.
    pub command_id: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// A message with an empty payload.
    pub fn minimal(ty: MessageType, command_id: u32) -> Self {
        Self {
            ty,
            command_id,
            payload: Vec::new(),
        }
    }

    /// A message with a JSON payload.
    pub fn with_json<T: Serialize>(ty: MessageType, command_id: u32, payload: &T) -> Self {
        let payload = serde_json::to_vec(payload).expect("payload serialization cannot fail");
        Self {
            ty,
            command_id,
            payload,
        }
    }

    /// A cluster service message carrying a single sub-code byte.
    pub fn cluster_service(command_id: u32, code: ClusterServiceCode) -> Self {
        Self {
            ty: MessageType::ClusterService,
            command_id,
            payload: vec![code.to_byte()],
        }
    }

    /// Parse the payload as JSON.
    pub fn json<'a, T: Deserialize<'a>>(&'a self) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// The cluster service sub-code, when this is a service message.
    pub fn service_code(&self) -> Option<ClusterServiceCode> {
        if self.ty != MessageType::ClusterService || self.payload.len() != 1 {
            return None;
        }
        ClusterServiceCode::from_byte(self.payload[0])
    }

    /// Encode into the wire framing.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());

        buf.push(self.ty.to_byte());
        buf.extend_from_slice(&self.command_id.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one frame from the front of `bytes`.
    ///
    /// Returns the packet and the number of bytes consumed, or `Ok(None)`
    /// when more bytes are needed for a complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Option<(Self, usize)>, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Ok(None);
        }

        let ty = MessageType::from_byte(bytes[0]).ok_or(DecodeError::UnknownType(bytes[0]))?;
        let command_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;

        if len > MAX_PAYLOAD_LEN {
            return Err(DecodeError::OversizedPayload(len));
        }
        if bytes.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let payload = bytes[HEADER_LEN..HEADER_LEN + len].to_vec();
        Ok(Some((
            Self {
                ty,
                command_id,
                payload,
            },
            HEADER_LEN + len,
        )))
    }
}

/// Payload of the coordinator beacon (`IAmCoordinator`).
///
/// These fields feed the split-brain tiebreak, so they travel in every
/// beacon even though `Info` carries a superset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconPayload {
    #[serde(rename = "State")]
    pub state: crate::node::NodeState,
    #[serde(rename = "SecondsSinceStartup")]
    pub seconds_since_startup: u64,
    #[serde(rename = "SecondsSinceStateChange")]
    pub seconds_since_state_change: u64,
    #[serde(rename = "QuorumStatus")]
    pub quorum_status: i32,
    #[serde(rename = "StandbyCount")]
    pub standby_count: u32,
    #[serde(rename = "Escalated")]
    pub escalated: bool,
}

/// Payload of a replicated failover vote (`FailoverRequest`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverRequestPayload {
    #[serde(rename = "Kind")]
    pub kind: FailoverKind,
    #[serde(rename = "NodeIdList")]
    pub node_ids: Vec<i32>,
    #[serde(rename = "Flags")]
    pub flags: u8,
}

/// Payload of a generic `Data` request.
///
/// `Data` carries the replicated commands that have no dedicated type byte;
/// the receiver answers with `Accept`/`Reject` or `CmdReplyInData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Request")]
pub enum DataRequest {
    /// Standby forwarding a middleware request for the coordinator's view.
    MasterData,
    /// Online recovery phase change, replicated to every peer.
    OnlineRecovery { phase: RecoveryPhase, node_id: i32 },
}

/// Phase of an online recovery as replicated between watchdogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryPhase {
    Start,
    End,
}

/// Consensus-relevant configuration exchanged via `PoolConfigData`.
///
/// The coordinator compares a joining standby's values against its own and
/// logs every mismatch; nothing is enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfigPayload {
    #[serde(rename = "NodeCount")]
    pub node_count: u32,
    #[serde(rename = "RequireQuorum")]
    pub require_quorum: bool,
    #[serde(rename = "RequireConsensus")]
    pub require_consensus: bool,
    #[serde(rename = "ConsensusWithHalfVotes")]
    pub enable_consensus_with_half_votes: bool,
    #[serde(rename = "AllowMultipleFailoverRequests")]
    pub allow_multiple_failover_requests_from_node: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeState;

    #[test]
    fn type_bytes_roundtrip() {
        for ty in MessageType::all() {
            assert_eq!(MessageType::from_byte(ty.to_byte()), Some(*ty));
        }
    }

    #[test]
    fn frame_roundtrip_every_type() {
        for (i, ty) in MessageType::all().iter().enumerate() {
            let packet = Packet {
                ty: *ty,
                command_id: 1000 + i as u32,
                payload: format!("{{\"n\":{}}}", i).into_bytes(),
            };

            let bytes = packet.encode();
            let (decoded, used) = Packet::decode(&bytes).unwrap().unwrap();

            assert_eq!(used, bytes.len());
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn decode_is_incremental() {
        let packet = Packet::with_json(
            MessageType::IAmCoordinator,
            7,
            &BeaconPayload {
                state: NodeState::Coordinator,
                seconds_since_startup: 60,
                seconds_since_state_change: 30,
                quorum_status: 1,
                standby_count: 2,
                escalated: true,
            },
        );
        let bytes = packet.encode();

        // Every proper prefix asks for more bytes.
        for cut in 0..bytes.len() {
            assert!(matches!(Packet::decode(&bytes[..cut]), Ok(None)));
        }

        // Two frames back to back decode one at a time.
        let mut stream = bytes.clone();
        stream.extend_from_slice(&Packet::minimal(MessageType::Accept, 7).encode());

        let (first, used) = Packet::decode(&stream).unwrap().unwrap();
        assert_eq!(first, packet);
        let (second, _) = Packet::decode(&stream[used..]).unwrap().unwrap();
        assert_eq!(second.ty, MessageType::Accept);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let mut bytes = Packet::minimal(MessageType::Accept, 1).encode();
        bytes[0] = b'z';

        assert!(matches!(
            Packet::decode(&bytes),
            Err(DecodeError::UnknownType(b'z'))
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut bytes = Packet::minimal(MessageType::Data, 1).encode();
        bytes[5..9].copy_from_slice(&(MAX_PAYLOAD_LEN as u32 + 1).to_be_bytes());

        assert!(matches!(
            Packet::decode(&bytes),
            Err(DecodeError::OversizedPayload(_))
        ));
    }

    #[test]
    fn service_code_roundtrip() {
        for code in [
            ClusterServiceCode::QuorumLost,
            ClusterServiceCode::QuorumFound,
            ClusterServiceCode::InSplitBrain,
            ClusterServiceCode::NeedsElection,
            ClusterServiceCode::IamTrueMaster,
            ClusterServiceCode::IamNotTrueMaster,
            ClusterServiceCode::IamResigningFromMaster,
            ClusterServiceCode::NodeInvalidVersion,
        ] {
            let packet = Packet::cluster_service(3, code);
            assert_eq!(packet.service_code(), Some(code));
        }
    }
}
