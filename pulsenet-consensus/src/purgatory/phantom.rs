use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use pulsenet_common::ShortNodeId;

use crate::adapters::Inbound;
use crate::lock;
use crate::member::Rank;
use crate::misbehavior::{FraudKind, FraudReport};
use crate::packet::{MemberPacket, PacketLimiter, PacketRecorder, PacketType, RecordedPacket};
use crate::profile::{equal_brief_profiles, equal_extensions, StaticProfile};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateFlags(u8);

impl UpdateFlags {
    pub const NONE: UpdateFlags = UpdateFlags(0);
    pub const CREATED: UpdateFlags = UpdateFlags(1);
    pub const UPDATED_PROFILE: UpdateFlags = UpdateFlags(2);

    pub fn contains(self, other: UpdateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for UpdateFlags {
    type Output = UpdateFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        UpdateFlags(self.0 | rhs.0)
    }
}

/// Everything learned about a phantom from announcements so far.
#[derive(Debug, Clone)]
struct Figment {
    announcer_id: ShortNodeId,
    rank: Rank,
    profile: Option<Arc<StaticProfile>>,
}

impl Figment {
    /// Merges an offered rank and profile. Returns `(updated, mismatched)`.
    fn update_profile(&mut self, rank: Rank, profile: Option<&Arc<StaticProfile>>) -> (bool, bool) {
        if rank != self.rank {
            return (false, true);
        }
        let Some(offered) = profile else {
            return (false, false);
        };
        let Some(current) = &self.profile else {
            self.profile = Some(Arc::clone(offered));
            return (true, false);
        };
        if !equal_brief_profiles(current, offered) {
            return (false, true);
        }
        if offered.extension.is_none() {
            return (false, false);
        }
        if current.extension.is_none() {
            self.profile = Some(Arc::clone(offered));
            return (true, false);
        }
        (false, !equal_extensions(current.extension.as_ref(), offered.extension.as_ref()))
    }
}

/// Data needed to admit a phantom into the population.
#[derive(Debug, Clone)]
pub struct Ascension {
    pub profile: Arc<StaticProfile>,
    pub rank: Rank,
    pub announcer_id: ShortNodeId,
}

#[derive(Debug, Default)]
pub struct FigmentUpdate {
    pub flags: UpdateFlags,
    pub ascension: Option<Ascension>,
}

#[derive(Debug)]
struct PhantomState {
    limiter: PacketLimiter,
    recorder: PacketRecorder,
    figment: Option<Figment>,
    drained: bool,
}

/// A node that sent packets but is not a member of the round population.
#[derive(Debug)]
pub struct NodePhantom {
    node_id: ShortNodeId,
    has_ascent: AtomicBool,
    state: Mutex<PhantomState>,
}

impl NodePhantom {
    pub fn new(node_id: ShortNodeId, limiter: PacketLimiter) -> Self {
        let capacity = limiter.remaining_packet_count_default();
        Self {
            node_id,
            has_ascent: AtomicBool::new(false),
            state: Mutex::new(PhantomState {
                limiter,
                recorder: PacketRecorder::new(capacity),
                figment: None,
                drained: false,
            }),
        }
    }

    pub fn node_id(&self) -> ShortNodeId {
        self.node_id
    }

    pub fn is_joiner(&self) -> bool {
        lock(&self.state).figment.as_ref().is_some_and(|f| f.rank.is_joiner())
    }

    pub fn profile(&self) -> Option<Arc<StaticProfile>> {
        lock(&self.state).figment.as_ref().and_then(|f| f.profile.clone())
    }

    pub fn announcer_id(&self) -> ShortNodeId {
        lock(&self.state)
            .figment
            .as_ref()
            .map(|f| f.announcer_id)
            .unwrap_or(ShortNodeId::ABSENT)
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

    pub fn recorded_count(&self) -> usize {
        lock(&self.state).recorder.len()
    }

    pub fn has_ascended(&self) -> bool {
        self.has_ascent.load(Ordering::Acquire)
    }

    /// One-way latch. Only the first caller gets `true`.
    pub fn try_ascend(&self) -> bool {
        self.has_ascent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Keeps a packet for replay after ascension. Once the recorder has been
    /// drained, packets go straight to `sink`.
    pub fn postpone_packet(&self, packet: MemberPacket, from: Inbound, sink: &UnboundedSender<RecordedPacket>) -> bool {
        debug!(
            "Packet added to purgatory: s={} t={} pt={}",
            packet.source,
            packet.target,
            packet.packet_type()
        );
        let mut state = lock(&self.state);
        if state.drained {
            return sink.send(RecordedPacket { packet, from }).is_ok();
        }
        state.recorder.record(packet, from)
    }

    /// Hands every recorded packet to `sink` in receipt order. The lock is
    /// held for the hand-off only; the packets are processed elsewhere.
    pub(crate) fn drain_to(&self, sink: &UnboundedSender<RecordedPacket>) -> usize {
        let mut state = lock(&self.state);
        state.drained = true;
        let packets = state.recorder.drain();
        let count = packets.len();
        for packet in packets {
            if sink.send(packet).is_err() {
                break;
            }
        }
        count
    }

    /// Applies an announcement about this phantom made by `announced_by`.
    /// A mismatch with what was announced before is reported as a fraud of
    /// the announcer.
    pub fn dispatch_announcement(
        &self,
        allow_brief_ascension: bool,
        rank: Rank,
        profile: Option<Arc<StaticProfile>>,
        announced_by: ShortNodeId,
    ) -> Result<FigmentUpdate, FraudReport> {
        let mut state = lock(&self.state);
        let mut update = FigmentUpdate::default();

        let figment = state.figment.get_or_insert_with(|| {
            update.flags = UpdateFlags::CREATED;
            Figment {
                announcer_id: ShortNodeId::ABSENT,
                rank,
                profile: None,
            }
        });
        if update.flags.contains(UpdateFlags::CREATED) {
            let kind = match &profile {
                Some(p) if p.is_full() => "full",
                Some(_) => "brief",
                None => "none",
            };
            debug!("Phantom node added: node={} profile={}", self.node_id, kind);
        }

        let (updated, mismatched) = figment.update_profile(rank, profile.as_ref());
        if mismatched {
            let suspect = if announced_by.is_absent() { self.node_id } else { announced_by };
            return Err(FraudReport::new(
                FraudKind::InconsistentNeighbourAnnouncement,
                suspect,
                self.node_id,
                format!("announced rank {rank} conflicts with figment rank {}", figment.rank),
            ));
        }

        let mut has_update = false;
        if updated {
            update.flags = update.flags | UpdateFlags::UPDATED_PROFILE;
            has_update = true;
        }
        if figment.announcer_id.is_absent()
            && !announced_by.is_absent()
            && (announced_by != self.node_id || !figment.rank.is_joiner())
        {
            figment.announcer_id = announced_by;
            has_update = true;
        }
        if !has_update {
            return Ok(update);
        }
        let Some(profile) = figment.profile.clone() else {
            return Ok(update);
        };

        // A joiner can't vouch for itself.
        let self_announced_joiner = figment.rank.is_joiner() && figment.announcer_id.is_absent();
        if !self_announced_joiner && (profile.is_full() || allow_brief_ascension) {
            update.ascension = Some(Ascension {
                profile,
                rank: figment.rank,
                announcer_id: figment.announcer_id,
            });
        }
        Ok(update)
    }
}
