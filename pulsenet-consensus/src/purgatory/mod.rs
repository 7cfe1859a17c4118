//! Holding area for nodes that talk to us before they are members.
//!
//! Packets from an unknown sender create a [`NodePhantom`]. Announcements,
//! the sender's own or relayed by neighbours, build up its figment until it
//! can ascend into the round population. Packets recorded meanwhile are
//! replayed through the replay channel in receipt order.

pub mod phantom;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use pulsenet_common::auth::Authenticator;
use pulsenet_common::{NodeRef, ShortNodeId};

use crate::adapters::Inbound;
use crate::error::ConsensusError;
use crate::lock;
use crate::member::{OpMode, Rank};
use crate::misbehavior::MisbehaviorRegistry;
use crate::packet::{MemberPacket, RecordedPacket};
use crate::population::{RealmPopulation, TrustLevel};
use crate::profile::StaticProfile;

pub use phantom::{Ascension, FigmentUpdate, NodePhantom, UpdateFlags};

/// Whether a phantom with only a brief profile may ascend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AscensionPolicy {
    pub allow_brief_ascension: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgatoryEvent {
    PhantomCreated {
        node_id: ShortNodeId,
        node_ref: Option<NodeRef>,
        is_joiner: bool,
    },
    Ascended {
        node_id: ShortNodeId,
        node_ref: NodeRef,
        is_joiner: bool,
    },
}

pub struct RealmPurgatory {
    population: Arc<RealmPopulation>,
    auth: Arc<dyn Authenticator>,
    policy: AscensionPolicy,
    misbehavior: Arc<MisbehaviorRegistry>,
    phantoms: Mutex<HashMap<ShortNodeId, Arc<NodePhantom>>>,
    replay: UnboundedSender<RecordedPacket>,
    observer: Option<UnboundedSender<PurgatoryEvent>>,
}

impl RealmPurgatory {
    pub fn new(
        population: Arc<RealmPopulation>,
        auth: Arc<dyn Authenticator>,
        policy: AscensionPolicy,
        misbehavior: Arc<MisbehaviorRegistry>,
        replay: UnboundedSender<RecordedPacket>,
    ) -> Self {
        Self {
            population,
            auth,
            policy,
            misbehavior,
            phantoms: Mutex::new(HashMap::new()),
            replay,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: UnboundedSender<PurgatoryEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn is_brief_ascension_allowed(&self) -> bool {
        self.policy.allow_brief_ascension
    }

    pub fn get_phantom(&self, id: ShortNodeId) -> Option<Arc<NodePhantom>> {
        lock(&self.phantoms).get(&id).cloned()
    }

    pub fn phantom_count(&self) -> usize {
        lock(&self.phantoms).len()
    }

    fn get_or_create_phantom(&self, id: ShortNodeId) -> Arc<NodePhantom> {
        let mut phantoms = lock(&self.phantoms);
        let phantom = phantoms
            .entry(id)
            .or_insert_with(|| Arc::new(NodePhantom::new(id, self.population.create_packet_limiter(true))));
        Arc::clone(phantom)
    }

    fn notify(&self, event: PurgatoryEvent) {
        if let Some(observer) = &self.observer {
            // The observer going away only stops notifications.
            let _ = observer.send(event);
        }
    }

    /// Handles a packet whose sender is not in the population. A self
    /// announcement must be signed with the key of the profile it carries;
    /// other packets are checked when they are replayed.
    pub fn dispatch_unknown_member_packet(&self, packet: MemberPacket, from: Inbound) -> Result<(), ConsensusError> {
        // Forged announcements are dropped before they can spend the
        // limiter budget of the node they impersonate.
        let announced = match packet.as_announcement() {
            Some(announcement) => {
                let profile = match &announcement.profile {
                    Some(profile) => {
                        if profile.node_id != packet.source {
                            return Err(ConsensusError::Malformed(format!(
                                "profile of node {} announced by node {}",
                                profile.node_id, packet.source
                            )));
                        }
                        if !packet.verify(self.auth.as_ref(), &profile.public_key) {
                            return Err(ConsensusError::Authenticity(packet.source));
                        }
                        Some(Arc::new(profile.clone()))
                    }
                    None => None,
                };
                Some((announcement.rank, profile))
            }
            None => None,
        };

        let phantom = self.get_or_create_phantom(packet.source);
        let packet_type = packet.packet_type();
        if !phantom.set_packet_received(packet_type) {
            return Err(ConsensusError::RateLimited {
                node: packet.source,
                packet_type,
            });
        }

        if let Some((rank, profile)) = announced {
            self.dispatch_announcement(packet.source, rank, profile, packet.source)?;
        }

        if !phantom.postpone_packet(packet, from, &self.replay) {
            debug!("Purgatory recorder full, packet dropped: node={}", phantom.node_id());
        }
        Ok(())
    }

    /// Applies an announcement about `node_id`. Returns `true` when it made
    /// the node ascend.
    pub fn dispatch_announcement(
        &self,
        node_id: ShortNodeId,
        rank: Rank,
        profile: Option<Arc<StaticProfile>>,
        announced_by: ShortNodeId,
    ) -> Result<bool, ConsensusError> {
        let profile = profile.map(|p| self.vouched_profile(p));
        let phantom = self.get_or_create_phantom(node_id);
        let node_ref = profile.as_ref().map(|p| p.node_ref);
        let update = match phantom.dispatch_announcement(self.is_brief_ascension_allowed(), rank, profile, announced_by) {
            Ok(update) => update,
            Err(report) => {
                warn!("Inconsistent neighbour announcement: {}", report);
                if let Some(announcer) = self.population.get_node_appearance(report.suspect) {
                    self.population.mark_fraud(&announcer);
                }
                self.misbehavior.register_fraud(report.clone());
                return Err(ConsensusError::Misbehavior(report));
            }
        };

        if update.flags.contains(UpdateFlags::CREATED) {
            self.population.on_purgatory_added();
            self.notify(PurgatoryEvent::PhantomCreated {
                node_id,
                node_ref,
                is_joiner: rank.is_joiner(),
            });
        }

        let Some(ascension) = update.ascension else {
            return Ok(false);
        };
        if !phantom.try_ascend() {
            return Ok(false);
        }
        self.ascend_from_purgatory(&phantom, ascension)?;
        Ok(true)
    }

    /// Keeps the extension only when a current member issued it. An
    /// extension nobody vouches for is dropped and the profile counts as
    /// brief.
    fn vouched_profile(&self, profile: Arc<StaticProfile>) -> Arc<StaticProfile> {
        let Some(extension) = &profile.extension else {
            return profile;
        };
        let issuer = self.population.get_active_node_appearance(extension.issuer_id);
        if let Some(issuer) = issuer {
            if profile.verify_extension(self.auth.as_ref(), &issuer.profile().public_key) {
                return profile;
            }
        }
        warn!(
            "Extension of node {} is not signed by issuer {}, keeping the brief profile",
            profile.node_id, extension.issuer_id
        );
        Arc::new(profile.brief())
    }

    fn ascend_from_purgatory(&self, phantom: &NodePhantom, ascension: Ascension) -> Result<(), ConsensusError> {
        let node_id = phantom.node_id();
        let Ascension {
            profile,
            rank,
            announcer_id,
        } = ascension;

        let node = match self.population.add_reservation(node_id) {
            (_, Some(existing)) => existing,
            (_, None) => {
                let appearance = crate::population::NodeAppearance::new(
                    Arc::clone(&profile),
                    rank,
                    profile.startup_power(),
                    OpMode::Normal,
                    self.population.create_packet_limiter(rank.is_joiner()),
                );
                self.population.add_to_dynamics(Arc::new(appearance))?
            }
        };
        if announcer_id != node_id {
            self.population.update_trust(&node, TrustLevel::BySome);
        }
        self.population.on_purgatory_ascent();

        info!(
            target: "consensus",
            "EVENT:ASCENSION node={} ref={} joiner={} full={} announcer={}",
            node_id,
            profile.node_ref,
            rank.is_joiner(),
            profile.is_full(),
            announcer_id
        );
        self.notify(PurgatoryEvent::Ascended {
            node_id,
            node_ref: profile.node_ref,
            is_joiner: rank.is_joiner(),
        });

        let replayed = phantom.drain_to(&self.replay);
        debug!("Replaying {} postponed packets of node {}", replayed, node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::{CensusMember, OnlinePopulation};
    use crate::member::{Power, PrimaryRole};
    use crate::packet::{EntropyReveal, MemberAnnouncement, PacketBody};
    use pulsenet_common::auth::ed25519::Ed25519Authenticator;
    use pulsenet_common::{Bits256, PulseData, PulseNumber};
    use std::thread;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Fixture {
        purgatory: Arc<RealmPurgatory>,
        issuer: Ed25519Authenticator,
        population: Arc<RealmPopulation>,
        registry: Arc<MisbehaviorRegistry>,
        replay_rx: UnboundedReceiver<RecordedPacket>,
    }

    fn fixture(policy: AscensionPolicy) -> Fixture {
        let issuer = Ed25519Authenticator::generate();
        let members = (1..=3)
            .map(|id| {
                let key = if id == 1 { issuer.public_key() } else { vec![id as u8; 32] };
                let profile = StaticProfile::new(ShortNodeId(id), PrimaryRole::Virtual, key, format!("n{id}"));
                CensusMember::new(profile, Power(1), OpMode::Normal)
            })
            .collect();
        let census = OnlinePopulation::new(members, ShortNodeId(1)).unwrap();
        let population = Arc::new(RealmPopulation::new(&census, vec![], ShortNodeId(1)).unwrap());
        population.seal_indexed(3).unwrap();
        let registry = Arc::new(MisbehaviorRegistry::new());
        let (tx, replay_rx) = mpsc::unbounded_channel();
        let purgatory = Arc::new(RealmPurgatory::new(
            Arc::clone(&population),
            Arc::new(Ed25519Authenticator::generate()),
            policy,
            Arc::clone(&registry),
            tx,
        ));
        Fixture {
            purgatory,
            issuer,
            population,
            registry,
            replay_rx,
        }
    }

    /// Brief and full profiles of joiner 9, the extension issued by member 1.
    fn joiner_profiles(f: &Fixture, auth: &Ed25519Authenticator) -> (Arc<StaticProfile>, Arc<StaticProfile>) {
        let brief = StaticProfile::new(ShortNodeId(9), PrimaryRole::LightMaterial, auth.public_key(), "n9");
        let ext = brief
            .issue_extension(Power(1), PulseNumber::MIN_TIME, ShortNodeId(1), &f.issuer)
            .unwrap();
        let full = brief.clone().with_extension(ext);
        (Arc::new(brief), Arc::new(full))
    }

    #[test]
    fn test_brief_then_full_then_conflicting_rank() {
        let f = fixture(AscensionPolicy::default());
        let auth = Ed25519Authenticator::generate();
        let (brief, full) = joiner_profiles(&f, &auth);

        // A: brief profile relayed by node 2. No brief ascension allowed.
        assert!(!f.purgatory.dispatch_announcement(ShortNodeId(9), Rank::joiner(), Some(brief), ShortNodeId(2)).unwrap());
        let phantom = f.purgatory.get_phantom(ShortNodeId(9)).unwrap();
        assert!(!phantom.has_ascended());

        // B: same node, full profile. Upgrades and ascends.
        assert!(f.purgatory.dispatch_announcement(ShortNodeId(9), Rank::joiner(), Some(full), ShortNodeId(2)).unwrap());
        assert!(phantom.has_ascended());
        let joiner = f.population.get_joiner_node_appearance(ShortNodeId(9)).unwrap();
        assert!(joiner.profile().is_full());
        assert_eq!(joiner.trust_level(), TrustLevel::BySome);
        assert_eq!(f.population.get_purgatory_counts(), (1, 1));

        // C: different rank for the same node. Rejected and blamed on node 3.
        let other_rank = Rank::new(PrimaryRole::LightMaterial, Power(1), 0, 4);
        let err = f
            .purgatory
            .dispatch_announcement(ShortNodeId(9), other_rank, None, ShortNodeId(3))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::Misbehavior(_)));
        assert!(f.registry.is_fraudulent(ShortNodeId(3)));
        let announcer = f.population.get_node_appearance(ShortNodeId(3)).unwrap();
        assert_eq!(announcer.trust_level(), TrustLevel::Fraud);
    }

    #[test]
    fn test_brief_ascension_when_allowed() {
        let f = fixture(AscensionPolicy {
            allow_brief_ascension: true,
        });
        let auth = Ed25519Authenticator::generate();
        let (brief, _) = joiner_profiles(&f, &auth);
        assert!(f.purgatory.dispatch_announcement(ShortNodeId(9), Rank::joiner(), Some(brief), ShortNodeId(2)).unwrap());
        assert_eq!(f.population.get_dynamic_counts(), (1, 0));
    }

    #[test]
    fn test_joiner_cannot_ascend_by_itself() {
        let f = fixture(AscensionPolicy {
            allow_brief_ascension: true,
        });
        let auth = Ed25519Authenticator::generate();
        let (_, full) = joiner_profiles(&f, &auth);
        assert!(!f
            .purgatory
            .dispatch_announcement(ShortNodeId(9), Rank::joiner(), Some(Arc::clone(&full)), ShortNodeId(9))
            .unwrap());
        assert_eq!(f.purgatory.get_phantom(ShortNodeId(9)).unwrap().announcer_id(), ShortNodeId::ABSENT);

        // A neighbour vouching for it is enough.
        assert!(f.purgatory.dispatch_announcement(ShortNodeId(9), Rank::joiner(), None, ShortNodeId(2)).unwrap());
    }

    fn announcement_packet(auth: &Ed25519Authenticator, profile: &StaticProfile) -> MemberPacket {
        let pulse = PulseData::new_first_ephemeral();
        let ann = MemberAnnouncement {
            member_id: profile.node_id,
            rank: Rank::joiner(),
            power: Power(1),
            mode: OpMode::Normal,
            profile: Some(profile.clone()),
            announced_by: profile.node_id,
            pulse,
            entropy_commitment: [0u8; 32],
        };
        MemberPacket::new(pulse.number, profile.node_id, ShortNodeId(1), PacketBody::Announcement(ann))
            .sign(auth)
            .unwrap()
    }

    #[test]
    fn test_unknown_packets_replay_in_order() {
        let mut f = fixture(AscensionPolicy::default());
        let auth = Ed25519Authenticator::generate();
        let (_, full) = joiner_profiles(&f, &auth);

        let announcement = announcement_packet(&auth, &full);
        f.purgatory
            .dispatch_unknown_member_packet(announcement.clone(), Inbound::new("n9"))
            .unwrap();
        let entropy = MemberPacket::new(
            announcement.pulse_number,
            ShortNodeId(9),
            ShortNodeId(1),
            PacketBody::Entropy(EntropyReveal { entropy: Bits256::random() }),
        )
        .sign(&auth)
        .unwrap();
        f.purgatory
            .dispatch_unknown_member_packet(entropy.clone(), Inbound::new("n9"))
            .unwrap();
        assert_eq!(f.purgatory.get_phantom(ShortNodeId(9)).unwrap().recorded_count(), 2);
        assert!(f.replay_rx.try_recv().is_err());

        // A neighbour relays the joiner: it ascends and the recorder drains.
        assert!(f.purgatory.dispatch_announcement(ShortNodeId(9), Rank::joiner(), None, ShortNodeId(2)).unwrap());
        assert_eq!(f.replay_rx.try_recv().unwrap().packet, announcement);
        assert_eq!(f.replay_rx.try_recv().unwrap().packet, entropy);
        assert!(f.replay_rx.try_recv().is_err());
    }

    #[test]
    fn test_forged_self_announcement_rejected() {
        let f = fixture(AscensionPolicy::default());
        let auth = Ed25519Authenticator::generate();
        let impostor = Ed25519Authenticator::generate();
        let (_, full) = joiner_profiles(&f, &auth);
        let forged = announcement_packet(&impostor, &full);
        assert!(matches!(
            f.purgatory.dispatch_unknown_member_packet(forged, Inbound::new("n9")),
            Err(ConsensusError::Authenticity(_))
        ));
    }

    #[test]
    fn test_forged_announcement_does_not_spend_limiter() {
        let f = fixture(AscensionPolicy::default());
        let auth = Ed25519Authenticator::generate();
        let impostor = Ed25519Authenticator::generate();
        let (_, full) = joiner_profiles(&f, &auth);
        for _ in 0..3 {
            let forged = announcement_packet(&impostor, &full);
            assert!(matches!(
                f.purgatory.dispatch_unknown_member_packet(forged, Inbound::new("evil")),
                Err(ConsensusError::Authenticity(_))
            ));
        }
        let genuine = announcement_packet(&auth, &full);
        assert!(f.purgatory.dispatch_unknown_member_packet(genuine, Inbound::new("n9")).is_ok());
    }

    #[test]
    fn test_self_issued_extension_is_not_full() {
        let f = fixture(AscensionPolicy::default());
        let auth = Ed25519Authenticator::generate();
        let brief = StaticProfile::new(ShortNodeId(9), PrimaryRole::LightMaterial, auth.public_key(), "n9");
        let ext = brief
            .issue_extension(Power(200), PulseNumber::MIN_TIME, ShortNodeId(9), &auth)
            .unwrap();
        let forged = Arc::new(brief.clone().with_extension(ext));
        assert!(!f
            .purgatory
            .dispatch_announcement(ShortNodeId(9), Rank::joiner(), Some(forged), ShortNodeId(2))
            .unwrap());
        assert!(!f.purgatory.get_phantom(ShortNodeId(9)).unwrap().has_ascended());
        assert_eq!(f.population.get_joiners_count(), 0);
    }

    #[test]
    fn test_extension_signed_by_wrong_member_is_not_full() {
        let f = fixture(AscensionPolicy::default());
        let auth = Ed25519Authenticator::generate();
        let brief = StaticProfile::new(ShortNodeId(9), PrimaryRole::LightMaterial, auth.public_key(), "n9");
        // Claims member 2 issued it but carries member 1's signature.
        let ext = brief
            .issue_extension(Power(1), PulseNumber::MIN_TIME, ShortNodeId(2), &f.issuer)
            .unwrap();
        let forged = Arc::new(brief.clone().with_extension(ext));
        assert!(!f
            .purgatory
            .dispatch_announcement(ShortNodeId(9), Rank::joiner(), Some(forged), ShortNodeId(3))
            .unwrap());
        assert_eq!(f.population.get_joiners_count(), 0);
    }

    #[test]
    fn test_unknown_sender_is_rate_limited() {
        let f = fixture(AscensionPolicy::default());
        let auth = Ed25519Authenticator::generate();
        let packet = MemberPacket::new(
            PulseNumber::MIN_TIME,
            ShortNodeId(9),
            ShortNodeId(1),
            PacketBody::Entropy(EntropyReveal { entropy: Bits256::ZERO }),
        )
        .sign(&auth)
        .unwrap();
        assert!(f.purgatory.dispatch_unknown_member_packet(packet.clone(), Inbound::new("n9")).is_ok());
        assert!(matches!(
            f.purgatory.dispatch_unknown_member_packet(packet, Inbound::new("n9")),
            Err(ConsensusError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_concurrent_ascension_happens_once() {
        let mut f = fixture(AscensionPolicy::default());
        let auth = Ed25519Authenticator::generate();
        let (_, full) = joiner_profiles(&f, &auth);
        let packet = announcement_packet(&auth, &full);
        f.purgatory.dispatch_unknown_member_packet(packet.clone(), Inbound::new("n9")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let purgatory = Arc::clone(&f.purgatory);
                thread::spawn(move || {
                    let announcer = ShortNodeId(2 + (i % 2));
                    purgatory
                        .dispatch_announcement(ShortNodeId(9), Rank::joiner(), None, announcer)
                        .unwrap()
                })
            })
            .collect();
        let ascended = handles.into_iter().map(|h| h.join().unwrap()).filter(|a| *a).count();
        assert_eq!(ascended, 1);

        let phantom = f.purgatory.get_phantom(ShortNodeId(9)).unwrap();
        // The latch refuses any further attempt.
        assert!(!phantom.try_ascend());
        assert_eq!(f.replay_rx.try_recv().unwrap().packet, packet);
        assert!(f.replay_rx.try_recv().is_err());
        assert_eq!(f.population.get_joiners_count(), 1);
    }
}
