use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use pulsenet_common::auth::Authenticator;
use pulsenet_common::{PulseData, ShortNodeId};

use crate::adapters::{Inbound, PacketProcessor};
use crate::error::ConsensusError;
use crate::keeper::PopulationKeeper;
use crate::lock;
use crate::packet::{InboundPacket, MemberPacket};
use crate::phases::{RealmRound, SyncService};

/// What the processor asks the controller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundEvent {
    /// A pulse from the pulsar.
    Pulse(PulseData),
    /// A member of the last census announced a pulse ahead of ours.
    PeerPulse(PulseData),
}

/// Routes inbound packets to the open round. Packets for a later pulse are
/// held until its round opens; packets for an earlier one are dropped.
pub struct RoundProcessor {
    local_id: ShortNodeId,
    current: RwLock<Option<Arc<RealmRound>>>,
    early: Mutex<VecDeque<(MemberPacket, Inbound)>>,
    early_capacity: usize,
    events: UnboundedSender<RoundEvent>,
    sync: Arc<SyncService>,
    keeper: Arc<PopulationKeeper>,
    auth: Arc<dyn Authenticator>,
}

impl RoundProcessor {
    pub fn new(
        local_id: ShortNodeId,
        early_capacity: usize,
        events: UnboundedSender<RoundEvent>,
        sync: Arc<SyncService>,
        keeper: Arc<PopulationKeeper>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            local_id,
            current: RwLock::new(None),
            early: Mutex::new(VecDeque::new()),
            early_capacity,
            events,
            sync,
            keeper,
            auth,
        }
    }

    pub fn current_round(&self) -> Option<Arc<RealmRound>> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn early_count(&self) -> usize {
        lock(&self.early).len()
    }

    /// Makes `round` the target of inbound packets and replays the packets
    /// held for its pulse. Held packets for older pulses are discarded.
    pub fn open_round(&self, round: Arc<RealmRound>) {
        let pulse_number = round.pulse_number();
        let ready: Vec<(MemberPacket, Inbound)> = {
            let mut early = lock(&self.early);
            *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&round));
            let (ready, later): (VecDeque<_>, VecDeque<_>) = early
                .drain(..)
                .filter(|(packet, _)| packet.pulse_number >= pulse_number)
                .partition(|(packet, _)| packet.pulse_number == pulse_number);
            *early = later;
            ready.into_iter().collect()
        };

        if !ready.is_empty() {
            debug!("Replaying {} early packets for pulse {}", ready.len(), pulse_number);
        }
        for (packet, from) in ready {
            let source = packet.source;
            if let Err(e) = round.dispatch_member_packet(packet, from) {
                debug!("Dropped early packet from node {}: {}", source, e);
            }
        }
    }

    fn notify(&self, event: RoundEvent) {
        // The controller is gone only during shutdown.
        let _ = self.events.send(event);
    }

    /// Whether a member of the last sealed census signed `packet`.
    fn is_signed_by_member(&self, packet: &MemberPacket) -> bool {
        let Some(accessor) = self.keeper.latest_accessor() else {
            return false;
        };
        match accessor.get_active_node_by_short_id(packet.source) {
            Some(member) => packet.verify(self.auth.as_ref(), &member.profile.public_key),
            None => false,
        }
    }

    fn process_member_packet(&self, packet: MemberPacket, from: Inbound) -> Result<(), ConsensusError> {
        let round = {
            let mut early = lock(&self.early);
            match self.current_round() {
                Some(round) if round.pulse_number() == packet.pulse_number => round,
                Some(round) if round.pulse_number() > packet.pulse_number => {
                    debug!(
                        "Dropped packet for past pulse {} from node {}",
                        packet.pulse_number, packet.source
                    );
                    return Ok(());
                }
                _ => {
                    if early.len() >= self.early_capacity {
                        debug!("Early packet buffer full, dropped packet from node {}", packet.source);
                        return Ok(());
                    }
                    if let Some(announcement) = packet.as_announcement() {
                        // Unverified packets still wait for the round, which
                        // checks them, but cannot move our pulse.
                        if announcement.pulse.number == packet.pulse_number && self.is_signed_by_member(&packet) {
                            self.notify(RoundEvent::PeerPulse(announcement.pulse));
                        } else {
                            debug!("Pulse {} from node {} not taken as a peer pulse", packet.pulse_number, packet.source);
                        }
                    }
                    early.push_back((packet, from));
                    return Ok(());
                }
            }
        };
        round.dispatch_member_packet(packet, from)
    }
}

#[async_trait]
impl PacketProcessor for RoundProcessor {
    async fn process_packet(&self, packet: InboundPacket, from: Inbound) -> Result<(), ConsensusError> {
        match packet {
            InboundPacket::Pulse { pulse, .. } => {
                if !from.is_pulsar() {
                    return Err(ConsensusError::Malformed(format!("pulse from {from}")));
                }
                if !pulse.is_valid_pulsar_data() {
                    return Err(ConsensusError::Malformed(format!("invalid pulse {pulse}")));
                }
                self.notify(RoundEvent::Pulse(pulse));
                Ok(())
            }
            InboundPacket::Member(packet) => {
                if packet.target != self.local_id {
                    return Err(ConsensusError::Malformed(format!(
                        "packet for node {} delivered to node {}",
                        packet.target, self.local_id
                    )));
                }
                if !packet.packet_type().is_round_packet() {
                    return self.sync.handle_packet(packet, from).await;
                }
                self.process_member_packet(packet, from)
            }
        }
    }
}
