use pulsenet_common::{PulseError, PulseNetError, ShortNodeId};
use pulsenet_p2p::NetworkError;
use thiserror::Error;

use crate::misbehavior::FraudReport;
use crate::packet::PacketType;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Authenticity check failed for packet from node {0}")]
    Authenticity(ShortNodeId),

    #[error("Packet {packet_type} from node {node} exceeds its round budget")]
    RateLimited {
        node: ShortNodeId,
        packet_type: PacketType,
    },

    #[error("Misbehavior: {0}")]
    Misbehavior(FraudReport),

    /// A local contract was broken (double seal, capacity mismatch, admission
    /// after seal). Never caused by a remote peer.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("Round failed: {0}")]
    RoundFailure(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Pulse(#[from] PulseError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Common(#[from] PulseNetError),
}

impl From<bincode::Error> for ConsensusError {
    fn from(e: bincode::Error) -> Self {
        ConsensusError::Malformed(e.to_string())
    }
}

impl ConsensusError {
    /// Errors caused by a remote packet. These are logged and the packet
    /// dropped; anything else points at a local problem.
    pub fn is_packet_error(&self) -> bool {
        matches!(
            self,
            ConsensusError::Malformed(_)
                | ConsensusError::Authenticity(_)
                | ConsensusError::RateLimited { .. }
                | ConsensusError::Misbehavior(_)
        )
    }
}
