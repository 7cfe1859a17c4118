use std::fmt;

use serde::{Deserialize, Serialize};

use pulsenet_common::auth::Authenticator;
use pulsenet_common::{Bits256, PulseData, PulseNumber, ShortNodeId};

use crate::census::CensusMember;
use crate::error::ConsensusError;
use crate::member::{OpMode, Power, Rank};
use crate::profile::StaticProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Pulsar,
    Announcement,
    Vector,
    Entropy,
    Finalize,
    SyncRequest,
    SyncReply,
}

impl PacketType {
    pub const COUNT: usize = 7;

    pub fn index(self) -> usize {
        self as usize
    }

    /// Sync packets are answered outside of the round.
    pub fn is_round_packet(self) -> bool {
        !matches!(self, PacketType::SyncRequest | PacketType::SyncReply)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAnnouncement {
    pub member_id: ShortNodeId,
    pub rank: Rank,
    pub power: Power,
    pub mode: OpMode,
    pub profile: Option<StaticProfile>,
    /// Node that vouches for this announcement; the member itself unless relayed.
    pub announced_by: ShortNodeId,
    pub pulse: PulseData,
    /// SHA-256 of the entropy the member reveals later in the round.
    pub entropy_commitment: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorReport {
    /// Nodes the sender heard from directly this round.
    pub seen: Vec<ShortNodeId>,
    /// Joiner announcement packets relayed as received, signatures intact.
    pub joiners: Vec<MemberPacket>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntropyReveal {
    pub entropy: Bits256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeVote {
    pub cloud_hash: [u8; 32],
    pub member_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReply {
    pub request_id: u64,
    pub pulse: PulseData,
    pub cloud_hash: Option<[u8; 32]>,
    pub members: Vec<CensusMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketBody {
    Announcement(MemberAnnouncement),
    Vector(VectorReport),
    Entropy(EntropyReveal),
    Finalize(FinalizeVote),
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::Announcement(_) => PacketType::Announcement,
            PacketBody::Vector(_) => PacketType::Vector,
            PacketBody::Entropy(_) => PacketType::Entropy,
            PacketBody::Finalize(_) => PacketType::Finalize,
            PacketBody::SyncRequest(_) => PacketType::SyncRequest,
            PacketBody::SyncReply(_) => PacketType::SyncReply,
        }
    }
}

/// A signed packet from one member to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPacket {
    pub pulse_number: PulseNumber,
    pub source: ShortNodeId,
    pub target: ShortNodeId,
    pub body: PacketBody,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SigningView<'a> {
    pulse_number: PulseNumber,
    source: ShortNodeId,
    target: ShortNodeId,
    body: &'a PacketBody,
}

impl MemberPacket {
    pub fn new(pulse_number: PulseNumber, source: ShortNodeId, target: ShortNodeId, body: PacketBody) -> Self {
        Self {
            pulse_number,
            source,
            target,
            body,
            signature: Vec::new(),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, ConsensusError> {
        let view = SigningView {
            pulse_number: self.pulse_number,
            source: self.source,
            target: self.target,
            body: &self.body,
        };
        Ok(bincode::serialize(&view)?)
    }

    pub fn sign(mut self, auth: &dyn Authenticator) -> Result<Self, ConsensusError> {
        self.signature = auth.sign(&self.signing_bytes()?)?;
        Ok(self)
    }

    /// Verifies the signature against the sender's declared key. Any failure
    /// to check counts as an invalid signature.
    pub fn verify(&self, auth: &dyn Authenticator, public_key: &[u8]) -> bool {
        let Ok(bytes) = self.signing_bytes() else {
            return false;
        };
        auth.verify_with_key(&bytes, &self.signature, public_key)
            .unwrap_or(false)
    }

    pub fn as_announcement(&self) -> Option<&MemberAnnouncement> {
        match &self.body {
            PacketBody::Announcement(ann) => Some(ann),
            _ => None,
        }
    }
}

/// Packet as handed to a processor: either a member packet or a pulse from
/// the pulsar.
#[derive(Debug, Clone)]
pub enum InboundPacket {
    Member(MemberPacket),
    Pulse { pulse: PulseData, raw: Vec<u8> },
}

impl InboundPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            InboundPacket::Member(p) => p.packet_type(),
            InboundPacket::Pulse { .. } => PacketType::Pulsar,
        }
    }

    pub fn pulse_number(&self) -> PulseNumber {
        match self {
            InboundPacket::Member(p) => p.pulse_number,
            InboundPacket::Pulse { pulse, .. } => pulse.number,
        }
    }

    pub fn source_id(&self) -> ShortNodeId {
        match self {
            InboundPacket::Member(p) => p.source,
            InboundPacket::Pulse { .. } => ShortNodeId::ABSENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsenet_common::auth::ed25519::Ed25519Authenticator;

    #[test]
    fn test_sign_and_verify() {
        let auth = Ed25519Authenticator::generate();
        let other = Ed25519Authenticator::generate();
        let packet = MemberPacket::new(
            PulseNumber::MIN_TIME,
            ShortNodeId(1),
            ShortNodeId(2),
            PacketBody::Entropy(EntropyReveal { entropy: Bits256::random() }),
        )
        .sign(&auth)
        .unwrap();

        assert!(packet.verify(&auth, &auth.public_key()));
        assert!(!packet.verify(&auth, &other.public_key()));

        let mut tampered = packet.clone();
        tampered.target = ShortNodeId(3);
        assert!(!tampered.verify(&auth, &auth.public_key()));
    }

    #[test]
    fn test_unsigned_packet_does_not_verify() {
        let auth = Ed25519Authenticator::generate();
        let packet = MemberPacket::new(
            PulseNumber::MIN_TIME,
            ShortNodeId(1),
            ShortNodeId(2),
            PacketBody::SyncRequest(SyncRequest { request_id: 1 }),
        );
        assert!(!packet.verify(&auth, &auth.public_key()));
        assert_eq!(packet.packet_type(), PacketType::SyncRequest);
        assert!(!packet.packet_type().is_round_packet());
    }
}
