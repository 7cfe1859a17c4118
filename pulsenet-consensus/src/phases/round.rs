//! State of one pulse round on the local node.
//!
//! The controller drives the phases; inbound packets land here through
//! [`RealmRound::dispatch_member_packet`], either directly or replayed from
//! the purgatory once their sender ascends.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use pulsenet_common::auth::Authenticator;
use pulsenet_common::{Bits256, PulseData, PulseNumber, ShortNodeId};

use crate::adapters::Inbound;
use crate::census::CensusMember;
use crate::error::ConsensusError;
use crate::lock;
use crate::misbehavior::{Blame, BlameKind, MisbehaviorRegistry};
use crate::packet::{
    EntropyReveal, FinalizeVote, MemberAnnouncement, MemberPacket, PacketBody, VectorReport,
};
use crate::phases::cloud::{combine_entropy, compute_cloud_hash, entropy_commitment, join_priority};
use crate::phases::RoundPhase;
use crate::population::{NodeAppearance, RealmPopulation, TrustLevel};
use crate::profile::equal_brief_profiles;
use crate::purgatory::RealmPurgatory;
use crate::rules::bft_quorum;

/// Census agreed by the local node at the end of the finalizing phase.
#[derive(Debug, Clone)]
pub struct FinalizedCloud {
    pub members: Vec<CensusMember>,
    pub entropy: Bits256,
    pub cloud_hash: [u8; 32],
}

pub struct RealmRound {
    pulse: PulseData,
    population: Arc<RealmPopulation>,
    purgatory: Arc<RealmPurgatory>,
    misbehavior: Arc<MisbehaviorRegistry>,
    auth: Arc<dyn Authenticator>,
    local_entropy: Bits256,
    neighbour_quorum: usize,
    phase: Mutex<RoundPhase>,
    progress: Notify,
    join_claims: Mutex<BTreeMap<ShortNodeId, MemberPacket>>,
    finalized: Mutex<Option<FinalizedCloud>>,
}

impl RealmRound {
    pub fn new(
        pulse: PulseData,
        population: Arc<RealmPopulation>,
        purgatory: Arc<RealmPurgatory>,
        misbehavior: Arc<MisbehaviorRegistry>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let neighbour_quorum = bft_quorum(population.get_indexed_count()).saturating_sub(1).max(1);
        Self {
            pulse,
            population,
            purgatory,
            misbehavior,
            auth,
            local_entropy: Bits256::random(),
            neighbour_quorum,
            phase: Mutex::new(RoundPhase::Idle),
            progress: Notify::new(),
            join_claims: Mutex::new(BTreeMap::new()),
            finalized: Mutex::new(None),
        }
    }

    pub fn pulse(&self) -> PulseData {
        self.pulse
    }

    pub fn pulse_number(&self) -> PulseNumber {
        self.pulse.number
    }

    pub fn population(&self) -> &Arc<RealmPopulation> {
        &self.population
    }

    pub fn purgatory(&self) -> &Arc<RealmPurgatory> {
        &self.purgatory
    }

    pub fn phase(&self) -> RoundPhase {
        *lock(&self.phase)
    }

    pub fn set_phase(&self, phase: RoundPhase) {
        *lock(&self.phase) = phase;
        self.progress.notify_one();
    }

    /// Resolves when round state changed since the last wakeup. A change
    /// with nobody waiting is kept for the next call.
    pub async fn changed(&self) {
        self.progress.notified().await;
    }

    pub fn is_local_joiner(&self) -> bool {
        self.population.get_self().is_joiner()
    }

    /// Whether every peer the phase waits for has delivered. Joiners take
    /// no part in agreement and always wait out the phase.
    pub fn phase_complete(&self, phase: RoundPhase) -> bool {
        if self.is_local_joiner() {
            return false;
        }
        let local_id = self.population.local_id();
        let mut expected = self
            .population
            .get_any_nodes(true, false)
            .into_iter()
            .filter(|n| n.node_id() != local_id && !n.is_joiner() && n.trust_level() != TrustLevel::Fraud);

        match phase {
            RoundPhase::Announcing => expected.all(|n| n.has_announcement()),
            // Past the announcements only peers that showed up are waited for.
            RoundPhase::VectorExchange => expected.filter(|n| n.has_announcement()).all(|n| n.vector().is_some()),
            RoundPhase::EntropyExchange => expected
                .filter(|n| n.has_announcement())
                .all(|n| n.revealed_entropy().is_some()),
            RoundPhase::Finalizing => expected
                .filter(|n| n.has_announcement())
                .all(|n| n.cloud_vote().is_some()),
            RoundPhase::Idle | RoundPhase::Sealed => true,
        }
    }

    /// Entry point for member packets of this pulse.
    pub fn dispatch_member_packet(&self, packet: MemberPacket, from: Inbound) -> Result<(), ConsensusError> {
        if packet.pulse_number != self.pulse.number {
            return Err(ConsensusError::Malformed(format!(
                "packet for pulse {} dispatched to round {}",
                packet.pulse_number, self.pulse.number
            )));
        }
        if packet.source == self.population.local_id() {
            return Err(ConsensusError::Malformed("packet carries the local node id".into()));
        }

        let result = match self.population.get_node_appearance(packet.source) {
            Some(node) => self.dispatch_known(&node, packet),
            None => self.dispatch_unknown(packet, from),
        };
        self.progress.notify_one();
        result
    }

    fn dispatch_known(&self, node: &Arc<NodeAppearance>, packet: MemberPacket) -> Result<(), ConsensusError> {
        node.verify_packet_authenticity(&packet, self.auth.as_ref())?;
        let packet_type = packet.packet_type();
        if !node.set_packet_received(packet_type) {
            return Err(ConsensusError::RateLimited {
                node: packet.source,
                packet_type,
            });
        }

        match packet.body {
            PacketBody::Announcement(announcement) => self.handle_announcement(node, announcement),
            PacketBody::Vector(vector) => self.handle_vector(node, vector),
            PacketBody::Entropy(reveal) => {
                let revealed = self.check_fraud(node, node.reveal_entropy(reveal.entropy))?;
                if revealed {
                    self.population.update_trust(node, TrustLevel::BySelf);
                }
                Ok(())
            }
            PacketBody::Finalize(vote) => {
                if !node.set_cloud_vote(vote.cloud_hash) {
                    debug!("Repeated cloud vote from node {}", node.node_id());
                }
                Ok(())
            }
            PacketBody::SyncRequest(_) | PacketBody::SyncReply(_) => {
                Err(ConsensusError::Malformed("sync packet on the round path".into()))
            }
        }
    }

    fn dispatch_unknown(&self, packet: MemberPacket, from: Inbound) -> Result<(), ConsensusError> {
        let claim = packet
            .as_announcement()
            .filter(|ann| ann.rank.is_joiner())
            .map(|_| packet.clone());
        self.purgatory.dispatch_unknown_member_packet(packet, from)?;
        if let Some(claim) = claim {
            lock(&self.join_claims).entry(claim.source).or_insert(claim);
        }
        Ok(())
    }

    fn handle_announcement(&self, node: &NodeAppearance, announcement: MemberAnnouncement) -> Result<(), ConsensusError> {
        if announcement.pulse != self.pulse {
            return Err(ConsensusError::Malformed(format!(
                "node {} announced a different pulse {}",
                node.node_id(),
                announcement.pulse
            )));
        }
        if announcement.rank != node.rank() {
            return Err(ConsensusError::Malformed(format!(
                "node {} announced rank {} but holds {}",
                node.node_id(),
                announcement.rank,
                node.rank()
            )));
        }
        if announcement.announced_by != node.node_id() {
            return Err(ConsensusError::Malformed("announcement relayed as a direct packet".into()));
        }
        if let Some(profile) = &announcement.profile {
            if !equal_brief_profiles(profile, node.profile()) {
                return Err(ConsensusError::Malformed(format!(
                    "node {} announced a profile that differs from the census",
                    node.node_id()
                )));
            }
        }

        self.check_fraud(node, node.apply_announcement(announcement))?;
        self.population.update_trust(node, TrustLevel::BySelf);
        Ok(())
    }

    fn handle_vector(&self, node: &NodeAppearance, vector: VectorReport) -> Result<(), ConsensusError> {
        let reporter = node.node_id();
        if !node.set_vector(vector.seen.clone()) {
            debug!("Repeated vector from node {}", reporter);
            return Ok(());
        }
        self.population.update_trust(node, TrustLevel::BySelf);

        for id in vector.seen.into_iter().filter(|id| *id != reporter) {
            let Some(target) = self.population.get_node_appearance(id) else {
                continue;
            };
            let reports = target.add_neighbour_report(reporter);
            let level = if reports >= self.neighbour_quorum {
                TrustLevel::ByNeighbors
            } else {
                TrustLevel::BySome
            };
            self.population.update_trust(&target, level);
        }

        for relayed in vector.joiners {
            let joiner = relayed.source;
            if let Err(e) = self.handle_relayed_joiner(reporter, relayed) {
                debug!("Relayed joiner {} from node {} rejected: {}", joiner, reporter, e);
            }
        }
        Ok(())
    }

    /// A joiner announcement forwarded by `relayer`. The joiner's own
    /// signature must hold; the relayer becomes the announcer.
    fn handle_relayed_joiner(&self, relayer: ShortNodeId, packet: MemberPacket) -> Result<(), ConsensusError> {
        let Some(announcement) = packet.as_announcement() else {
            return Err(ConsensusError::Malformed("relayed packet is not an announcement".into()));
        };
        let Some(profile) = &announcement.profile else {
            return Err(ConsensusError::Malformed("relayed joiner without profile".into()));
        };
        if !announcement.rank.is_joiner() || profile.node_id != packet.source || packet.pulse_number != self.pulse.number {
            return Err(ConsensusError::Malformed(format!("bad relayed joiner {}", packet.source)));
        }
        if !packet.verify(self.auth.as_ref(), &profile.public_key) {
            return Err(ConsensusError::Authenticity(packet.source));
        }
        if packet.source == self.population.local_id() {
            return Ok(());
        }
        if let Some(joiner) = self.population.get_joiner_node_appearance(packet.source) {
            self.population.update_trust(&joiner, TrustLevel::BySome);
            return Ok(());
        }
        if self.population.get_active_node_appearance(packet.source).is_some() {
            return Err(ConsensusError::Malformed(format!(
                "relayed joiner {} is already a member",
                packet.source
            )));
        }
        self.purgatory
            .dispatch_announcement(packet.source, announcement.rank, Some(Arc::new(profile.clone())), relayer)?;
        Ok(())
    }

    fn check_fraud<T>(&self, node: &NodeAppearance, result: Result<T, ConsensusError>) -> Result<T, ConsensusError> {
        if let Err(ConsensusError::Misbehavior(report)) = &result {
            self.population.mark_fraud(node);
            if self.misbehavior.register_fraud(report.clone()) {
                warn!(
                    target: "consensus",
                    "EVENT:FRAUD pulse={} suspect={} kind={:?}",
                    self.pulse.number,
                    report.suspect,
                    report.kind
                );
            }
        }
        result
    }

    /// Local announcement, also applied to the local appearance so the
    /// entropy reveal can be checked against it.
    pub fn local_announcement(&self) -> Result<PacketBody, ConsensusError> {
        let local = self.population.get_self();
        let announcement = MemberAnnouncement {
            member_id: local.node_id(),
            rank: local.rank(),
            power: local.power(),
            mode: local.mode(),
            profile: local.is_joiner().then(|| (**local.profile()).clone()),
            announced_by: local.node_id(),
            pulse: self.pulse,
            entropy_commitment: entropy_commitment(&self.local_entropy),
        };
        local.apply_announcement(announcement.clone())?;
        Ok(PacketBody::Announcement(announcement))
    }

    /// Joiner claims heard directly, best priority first.
    pub fn join_claims(&self, limit: usize) -> Vec<MemberPacket> {
        let mut claims: Vec<MemberPacket> = lock(&self.join_claims).values().cloned().collect();
        claims.sort_by_key(|packet| {
            packet
                .as_announcement()
                .and_then(|ann| ann.profile.as_ref())
                .map(|profile| join_priority(&profile.node_ref, &self.pulse.entropy))
        });
        claims.truncate(limit);
        claims
    }

    /// Vector of the local node. Joiner claims heard directly are vouched
    /// for locally and relayed to the peers.
    pub fn local_vector(&self, max_joiners: usize) -> PacketBody {
        let local_id = self.population.local_id();
        let claims = self.join_claims(max_joiners);
        for claim in &claims {
            let Some(announcement) = claim.as_announcement() else {
                continue;
            };
            let profile = announcement.profile.clone().map(Arc::new);
            if let Err(e) = self
                .purgatory
                .dispatch_announcement(claim.source, announcement.rank, profile, local_id)
            {
                debug!("Joiner {} not vouched: {}", claim.source, e);
            }
        }
        PacketBody::Vector(VectorReport {
            seen: self.population.create_vector_helper().seen_ids(),
            joiners: claims,
        })
    }

    pub fn local_entropy_reveal(&self) -> Result<PacketBody, ConsensusError> {
        self.population.get_self().reveal_entropy(self.local_entropy)?;
        Ok(PacketBody::Entropy(EntropyReveal {
            entropy: self.local_entropy,
        }))
    }

    /// Fixes the membership, combined entropy and cloud hash of the round.
    pub fn finalize(&self, max_joiners: usize) -> Result<PacketBody, ConsensusError> {
        let local = self.population.get_self();
        let local_id = local.node_id();

        let nodes = self.population.get_any_nodes(true, false);
        let (joiners, members): (Vec<_>, Vec<_>) = nodes.into_iter().partition(|n| n.is_joiner());

        let mut selected: Vec<Arc<NodeAppearance>> = members
            .into_iter()
            .filter(|n| n.node_id() == local_id || n.trust_level() >= TrustLevel::BySelf)
            .filter(|n| !n.mode().is_evicted())
            .collect();
        let mut admitted: Vec<Arc<NodeAppearance>> = joiners
            .into_iter()
            .filter(|n| n.node_id() != local_id && n.trust_level() >= TrustLevel::BySelf)
            .collect();
        admitted.sort_by_key(|n| join_priority(&n.profile().node_ref, &self.pulse.entropy));
        admitted.truncate(max_joiners);
        selected.extend(admitted);

        let reveals: Vec<(ShortNodeId, Bits256)> = selected
            .iter()
            .filter_map(|n| n.revealed_entropy().map(|e| (n.node_id(), e)))
            .collect();
        for node in selected.iter().filter(|n| !n.is_joiner() && n.revealed_entropy().is_none()) {
            self.misbehavior.register_blame(Blame {
                kind: BlameKind::MissingEntropyReveal,
                suspect: node.node_id(),
                details: format!("no entropy reveal in pulse {}", self.pulse.number),
            });
        }

        let members: Vec<CensusMember> = selected
            .iter()
            .map(|n| CensusMember::new((**n.profile()).clone(), n.power(), n.mode()))
            .collect();
        let entropy = combine_entropy(self.pulse.entropy, &reveals);
        let cloud_hash = compute_cloud_hash(self.pulse.number, &entropy, &members);
        let member_count = u16::try_from(members.len())
            .map_err(|_| ConsensusError::InternalInvariant("census too large".into()))?;

        local.set_cloud_vote(cloud_hash);
        info!(
            target: "consensus",
            "EVENT:CLOUD_HASH pulse={} members={} hash={}",
            self.pulse.number,
            member_count,
            hex::encode(cloud_hash)
        );
        *lock(&self.finalized) = Some(FinalizedCloud {
            members,
            entropy,
            cloud_hash,
        });
        Ok(PacketBody::Finalize(FinalizeVote {
            cloud_hash,
            member_count,
        }))
    }

    pub fn finalized(&self) -> Option<FinalizedCloud> {
        lock(&self.finalized).clone()
    }

    /// Counts cloud hash votes matching ours, the local vote included.
    /// Returns `(agreeing, voters)` where voters are the non-joiner members
    /// of the census; disagreeing voters are blamed.
    pub fn cloud_hash_agreement(&self) -> (usize, usize) {
        let Some(finalized) = self.finalized() else {
            return (0, 0);
        };
        let local_id = self.population.local_id();
        let mut agreeing = 1;
        let mut voters = 1;
        for member in finalized.members.iter().filter(|m| m.profile.node_id != local_id) {
            let id = member.profile.node_id;
            let Some(node) = self.population.get_node_appearance(id) else {
                continue;
            };
            if node.is_joiner() {
                continue;
            }
            voters += 1;
            match node.cloud_vote() {
                Some(vote) if vote == finalized.cloud_hash => agreeing += 1,
                Some(vote) => {
                    self.misbehavior.register_blame(Blame {
                        kind: BlameKind::CloudHashMismatch,
                        suspect: id,
                        details: format!("voted {} in pulse {}", hex::encode(vote), self.pulse.number),
                    });
                }
                None => {}
            }
        }
        (agreeing, voters)
    }
}
