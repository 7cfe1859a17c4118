use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use pulsenet_common::auth::Authenticator;
use pulsenet_common::crypto::hash::digest_bytes;
use pulsenet_common::{Bits256, ShortNodeId};

use crate::error::ConsensusError;
use crate::lock;
use crate::member::{OpMode, Power, Rank};
use crate::misbehavior::{FraudKind, FraudReport};
use crate::packet::{MemberAnnouncement, MemberPacket, PacketLimiter, PacketType};
use crate::profile::StaticProfile;

/// How strongly the local node believes a peer takes part in the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    Fraud,
    Unknown,
    /// The node talked to us directly.
    BySelf,
    /// At least one neighbour reported the node.
    BySome,
    /// A quorum of neighbours reported the node.
    ByNeighbors,
}

#[derive(Debug)]
struct AppearanceState {
    trust: TrustLevel,
    power: Power,
    mode: OpMode,
    limiter: PacketLimiter,
    announcement: Option<MemberAnnouncement>,
    entropy: Option<Bits256>,
    vector: Option<Vec<ShortNodeId>>,
    cloud_vote: Option<[u8; 32]>,
    neighbour_reports: BTreeSet<ShortNodeId>,
}

/// Round-local record of one node.
#[derive(Debug)]
pub struct NodeAppearance {
    profile: Arc<StaticProfile>,
    rank: Rank,
    state: Mutex<AppearanceState>,
}

impl NodeAppearance {
    pub fn new(profile: Arc<StaticProfile>, rank: Rank, power: Power, mode: OpMode, limiter: PacketLimiter) -> Self {
        Self {
            profile,
            rank,
            state: Mutex::new(AppearanceState {
                trust: TrustLevel::Unknown,
                power,
                mode,
                limiter,
                announcement: None,
                entropy: None,
                vector: None,
                cloud_vote: None,
                neighbour_reports: BTreeSet::new(),
            }),
        }
    }

    pub fn node_id(&self) -> ShortNodeId {
        self.profile.node_id
    }

    pub fn profile(&self) -> &Arc<StaticProfile> {
        &self.profile
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn is_joiner(&self) -> bool {
        self.rank.is_joiner()
    }

    pub fn trust_level(&self) -> TrustLevel {
        lock(&self.state).trust
    }

    pub fn power(&self) -> Power {
        lock(&self.state).power
    }

    pub fn mode(&self) -> OpMode {
        lock(&self.state).mode
    }

    pub fn can_receive_packet(&self, packet_type: PacketType) -> bool {
        lock(&self.state).limiter.can_receive_packet(packet_type)
    }

    pub fn set_packet_received(&self, packet_type: PacketType) -> bool {
        lock(&self.state).limiter.set_packet_received(packet_type)
    }

    pub fn set_packet_sent(&self, packet_type: PacketType) -> bool {
        lock(&self.state).limiter.set_packet_sent(packet_type)
    }

    /// Checks that the packet comes from this node and carries its signature.
    pub fn verify_packet_authenticity(
        &self,
        packet: &MemberPacket,
        auth: &dyn Authenticator,
    ) -> Result<(), ConsensusError> {
        if packet.source != self.node_id() || !packet.verify(auth, &self.profile.public_key) {
            return Err(ConsensusError::Authenticity(packet.source));
        }
        Ok(())
    }

    /// Raises trust to `level`. Fraud is final and trust never drops; returns
    /// `true` when the level changed.
    pub(crate) fn raise_trust(&self, level: TrustLevel) -> bool {
        let mut state = lock(&self.state);
        if state.trust == TrustLevel::Fraud || level <= state.trust {
            return false;
        }
        state.trust = level;
        true
    }

    pub(crate) fn mark_fraud(&self) -> bool {
        let mut state = lock(&self.state);
        if state.trust == TrustLevel::Fraud {
            return false;
        }
        state.trust = TrustLevel::Fraud;
        true
    }

    /// Stores the node's own announcement. A repeated identical announcement
    /// returns `Ok(false)`; a different one is a fraud.
    pub fn apply_announcement(&self, announcement: MemberAnnouncement) -> Result<bool, ConsensusError> {
        let mut state = lock(&self.state);
        if let Some(existing) = &state.announcement {
            if *existing == announcement {
                return Ok(false);
            }
            return Err(ConsensusError::Misbehavior(FraudReport::new(
                FraudKind::ConflictingAnnouncement,
                self.node_id(),
                self.node_id(),
                "node announced itself twice with different content",
            )));
        }
        state.power = announcement.power;
        state.mode = announcement.mode;
        state.announcement = Some(announcement);
        Ok(true)
    }

    pub fn announcement(&self) -> Option<MemberAnnouncement> {
        lock(&self.state).announcement.clone()
    }

    pub fn has_announcement(&self) -> bool {
        lock(&self.state).announcement.is_some()
    }

    /// Records that `reporter` saw this node. Returns the number of distinct
    /// reporters so far.
    pub fn add_neighbour_report(&self, reporter: ShortNodeId) -> usize {
        let mut state = lock(&self.state);
        state.neighbour_reports.insert(reporter);
        state.neighbour_reports.len()
    }

    pub fn neighbour_report_count(&self) -> usize {
        lock(&self.state).neighbour_reports.len()
    }

    pub fn set_vector(&self, seen: Vec<ShortNodeId>) -> bool {
        let mut state = lock(&self.state);
        if state.vector.is_some() {
            return false;
        }
        state.vector = Some(seen);
        true
    }

    pub fn vector(&self) -> Option<Vec<ShortNodeId>> {
        lock(&self.state).vector.clone()
    }

    /// Accepts the revealed entropy if it matches the announced commitment.
    pub fn reveal_entropy(&self, entropy: Bits256) -> Result<bool, ConsensusError> {
        let mut state = lock(&self.state);
        let Some(announcement) = &state.announcement else {
            return Err(ConsensusError::Malformed(format!(
                "entropy from node {} before its announcement",
                self.node_id()
            )));
        };
        if digest_bytes(entropy.as_bytes()) != announcement.entropy_commitment {
            return Err(ConsensusError::Misbehavior(FraudReport::new(
                FraudKind::MismatchedEntropyReveal,
                self.node_id(),
                self.node_id(),
                "revealed entropy does not match the commitment",
            )));
        }
        if state.entropy.is_some() {
            return Ok(false);
        }
        state.entropy = Some(entropy);
        Ok(true)
    }

    pub fn revealed_entropy(&self) -> Option<Bits256> {
        lock(&self.state).entropy
    }

    pub fn set_cloud_vote(&self, cloud_hash: [u8; 32]) -> bool {
        let mut state = lock(&self.state);
        if state.cloud_vote.is_some() {
            return false;
        }
        state.cloud_vote = Some(cloud_hash);
        true
    }

    pub fn cloud_vote(&self) -> Option<[u8; 32]> {
        lock(&self.state).cloud_vote
    }
}
