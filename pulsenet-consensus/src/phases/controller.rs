//! Drives rounds: one per pulse, phase after phase, then seals the census.

use std::sync::{Arc, Mutex, RwLock};

use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use pulsenet_common::auth::Authenticator;
use pulsenet_common::{PulseData, ShortNodeId};
use pulsenet_p2p::Transport;

use crate::adapters::{DatagramHandler, PulseHandler};
use crate::census::OnlinePopulation;
use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::keeper::{PopulationAccessor, PopulationKeeper};
use crate::lock;
use crate::misbehavior::MisbehaviorRegistry;
use crate::packet::{MemberPacket, PacketBody, PacketCodec, RecordedPacket};
use crate::phases::{RealmRound, RoundEvent, RoundPhase, RoundProcessor, SyncService};
use crate::population::{RealmPopulation, TrustLevel};
use crate::profile::StaticProfile;
use crate::purgatory::{PurgatoryEvent, RealmPurgatory};
use crate::report::{OnConsensusFinished, Report};
use crate::rules::{bft_quorum, check_majority_rule, check_min_role, Certificate};
use crate::storage::PulseStorage;

pub struct RoundController {
    config: ConsensusConfig,
    local: Arc<StaticProfile>,
    auth: Arc<dyn Authenticator>,
    transport: Arc<dyn Transport>,
    codec: PacketCodec,
    keeper: Arc<PopulationKeeper>,
    certificate: Arc<dyn Certificate>,
    storage: Arc<dyn PulseStorage>,
    misbehavior: Arc<MisbehaviorRegistry>,
    sync: Arc<SyncService>,
    processor: Arc<RoundProcessor>,
    events: Mutex<Option<UnboundedReceiver<RoundEvent>>>,
    last_pulse: Mutex<Option<PulseData>>,
    on_finished: RwLock<Option<OnConsensusFinished>>,
    purgatory_observer: Mutex<Option<UnboundedSender<PurgatoryEvent>>>,
}

impl RoundController {
    pub fn new(
        config: ConsensusConfig,
        local: Arc<StaticProfile>,
        auth: Arc<dyn Authenticator>,
        transport: Arc<dyn Transport>,
        keeper: Arc<PopulationKeeper>,
        certificate: Arc<dyn Certificate>,
        storage: Arc<dyn PulseStorage>,
    ) -> Self {
        let codec = PacketCodec::new(config.max_packet_size);
        let sync = Arc::new(SyncService::new(
            Arc::clone(&local),
            Arc::clone(&auth),
            Arc::clone(&transport),
            codec,
            Arc::clone(&keeper),
            config.sync_timeout(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let processor = Arc::new(RoundProcessor::new(
            local.node_id,
            config.early_packet_buffer,
            events_tx,
            Arc::clone(&sync),
            Arc::clone(&keeper),
            Arc::clone(&auth),
        ));
        let last_pulse = keeper.latest_accessor().map(|accessor| accessor.pulse);

        Self {
            config,
            local,
            auth,
            transport,
            codec,
            keeper,
            certificate,
            storage,
            misbehavior: Arc::new(MisbehaviorRegistry::new()),
            sync,
            processor,
            events: Mutex::new(Some(events_rx)),
            last_pulse: Mutex::new(last_pulse),
            on_finished: RwLock::new(None),
            purgatory_observer: Mutex::new(None),
        }
    }

    pub fn set_on_finished(&self, callback: OnConsensusFinished) {
        *self.on_finished.write().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Receives purgatory events of every round from now on.
    pub fn set_purgatory_observer(&self, observer: UnboundedSender<PurgatoryEvent>) {
        *lock(&self.purgatory_observer) = Some(observer);
    }

    pub fn processor(&self) -> Arc<RoundProcessor> {
        Arc::clone(&self.processor)
    }

    pub fn misbehavior(&self) -> Arc<MisbehaviorRegistry> {
        Arc::clone(&self.misbehavior)
    }

    pub fn keeper(&self) -> Arc<PopulationKeeper> {
        Arc::clone(&self.keeper)
    }

    pub fn last_pulse(&self) -> Option<PulseData> {
        *lock(&self.last_pulse)
    }

    /// Handler to plug into the transport.
    pub fn datagram_handler(&self) -> DatagramHandler {
        let mut handler = DatagramHandler::new();
        handler.set_packet_parser_factory(Arc::new(self.codec));
        handler.set_packet_processor(self.processor());
        handler
    }

    pub fn pulse_handler(&self) -> PulseHandler {
        let mut handler = PulseHandler::new();
        handler.set_packet_processor(self.processor());
        handler
    }

    fn is_newer(&self, pulse: &PulseData) -> bool {
        match self.last_pulse() {
            Some(last) => pulse.number > last.number,
            None => true,
        }
    }

    /// Whether a peer's ephemeral pulse lies on our chain, at most
    /// `max_pulse_catch_up` pulses after the last one.
    fn is_reachable_ephemeral(&self, pulse: &PulseData) -> bool {
        if !pulse.is_valid_ephemeral_data() {
            return false;
        }
        let mut current = match self.last_pulse() {
            Some(last) if last.is_from_ephemeral() => last,
            _ => PulseData::new_first_ephemeral(),
        };
        for _ in 0..=self.config.max_pulse_catch_up {
            if current == *pulse {
                return true;
            }
            if current.number >= pulse.number {
                return false;
            }
            current = match current.create_next_ephemeral_pulse() {
                Ok(next) => next,
                Err(_) => return false,
            };
        }
        false
    }

    /// Whether a pulsar pulse may open a round. A pulse pointing back at
    /// our last pulse must chain from it; one pointing elsewhere restarts
    /// the chain and must still be newer.
    fn accept_pulsar_pulse(&self, pulse: &PulseData) -> bool {
        if !pulse.is_valid_pulsar_data() {
            warn!("Dropped malformed pulsar pulse {}", pulse.number);
            return false;
        }
        match self.last_pulse() {
            Some(last) if last.is_from_pulsar() => {
                if last.is_valid_next(pulse) {
                    return true;
                }
                if pulse.prev_pulse_number().ok() == Some(last.number) {
                    warn!("Pulsar pulse {} does not chain from pulse {}", pulse.number, last.number);
                    return false;
                }
                if !self.is_newer(pulse) {
                    return false;
                }
                warn!("Pulsar chain restarted at pulse {} after pulse {}", pulse.number, last.number);
                true
            }
            _ => self.is_newer(pulse),
        }
    }

    fn next_ephemeral_pulse(&self) -> Result<PulseData, ConsensusError> {
        match self.last_pulse() {
            Some(last) if last.is_from_ephemeral() => Ok(last.create_next_ephemeral_pulse()?),
            _ => Ok(PulseData::new_first_ephemeral()),
        }
    }

    /// Runs rounds until `shutdown` turns true. Pulses come from the pulsar,
    /// or in ephemeral mode from the local timer and from peers ahead of us.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut events) = lock(&self.events).take() else {
            error!("Round controller is already running");
            return;
        };
        let mut ticker = tokio::time::interval(self.config.pulse_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Round controller started: node={} ephemeral={}",
            self.local.node_id, self.config.ephemeral
        );

        loop {
            let pulse = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                event = events.recv() => match event {
                    None => break,
                    Some(RoundEvent::Pulse(pulse)) if !self.config.ephemeral => {
                        if !self.accept_pulsar_pulse(&pulse) {
                            continue;
                        }
                        pulse
                    }
                    Some(RoundEvent::Pulse(pulse)) => {
                        debug!("Ignoring pulsar pulse {} in ephemeral mode", pulse.number);
                        continue;
                    }
                    Some(RoundEvent::PeerPulse(pulse)) => {
                        if !self.config.ephemeral {
                            continue;
                        }
                        if !self.is_reachable_ephemeral(&pulse) {
                            debug!("Ignoring peer pulse {} off our ephemeral chain", pulse.number);
                            continue;
                        }
                        pulse
                    }
                },
                _ = ticker.tick(), if self.config.ephemeral => match self.next_ephemeral_pulse() {
                    Ok(pulse) => pulse,
                    Err(e) => {
                        warn!("Cannot derive the next ephemeral pulse: {}", e);
                        continue;
                    }
                },
            };
            if !self.is_newer(&pulse) {
                continue;
            }
            if let Err(e) = self.run_round(pulse).await {
                error!("Round for pulse {} failed: {}", pulse.number, e);
            }
        }
        info!("Round controller stopped: node={}", self.local.node_id);
    }

    /// Runs one full round for `pulse` and seals its outcome.
    pub async fn run_round(&self, pulse: PulseData) -> Result<Report, ConsensusError> {
        let previous = self
            .keeper
            .latest_accessor()
            .ok_or_else(|| ConsensusError::InternalInvariant("no census to start the round from".into()))?;
        let census = &previous.population;
        let local_id = self.local.node_id;
        let is_joiner = census.get_member(local_id).is_none();
        let joiners = if is_joiner { vec![Arc::clone(&self.local)] } else { Vec::new() };

        let population = Arc::new(RealmPopulation::new(census, joiners, local_id)?);
        population.seal_indexed(census.indexed_count())?;

        let (replay_tx, mut replay_rx) = mpsc::unbounded_channel::<RecordedPacket>();
        let mut purgatory = RealmPurgatory::new(
            Arc::clone(&population),
            Arc::clone(&self.auth),
            self.config.ascension,
            Arc::clone(&self.misbehavior),
            replay_tx,
        );
        if let Some(observer) = lock(&self.purgatory_observer).clone() {
            purgatory = purgatory.with_observer(observer);
        }
        let round = Arc::new(RealmRound::new(
            pulse,
            population,
            Arc::new(purgatory),
            Arc::clone(&self.misbehavior),
            Arc::clone(&self.auth),
        ));

        let weak = Arc::downgrade(&round);
        let replay = tokio::spawn(async move {
            while let Some(RecordedPacket { packet, from }) = replay_rx.recv().await {
                let Some(round) = weak.upgrade() else {
                    break;
                };
                let source = packet.source;
                if let Err(e) = round.dispatch_member_packet(packet, from) {
                    debug!("Replayed packet from node {} dropped: {}", source, e);
                }
            }
        });

        info!(
            target: "consensus",
            "EVENT:ROUND_STARTED pulse={} node={} members={} joiner={}",
            pulse.number,
            local_id,
            census.indexed_count(),
            is_joiner
        );
        self.processor.open_round(Arc::clone(&round));

        let outcome = self.run_phases(&round, is_joiner).await;
        round.set_phase(RoundPhase::Sealed);
        let report = match outcome {
            Ok(()) if is_joiner => Ok(self.seal_joiner(&round, &previous).await),
            Ok(()) => self.seal(&round, &previous),
            Err(e) => Err(e),
        };
        replay.abort();
        let report = report?;

        if let Err(e) = self.storage.append(pulse).await {
            warn!("Failed to store pulse {}: {}", pulse.number, e);
        }
        *lock(&self.last_pulse) = Some(pulse);

        let callback = self.on_finished.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(callback) = callback {
            callback(report);
        }
        Ok(report)
    }

    async fn run_phases(&self, round: &Arc<RealmRound>, is_joiner: bool) -> Result<(), ConsensusError> {
        let max_joiners = self.config.max_joiners_per_pulse;
        for phase in RoundPhase::ACTIVE {
            round.set_phase(phase);
            let body = match phase {
                RoundPhase::Announcing => Some(round.local_announcement()?),
                // Joiners only announce themselves.
                _ if is_joiner => None,
                RoundPhase::VectorExchange => Some(round.local_vector(max_joiners)),
                RoundPhase::EntropyExchange => Some(round.local_entropy_reveal()?),
                RoundPhase::Finalizing => Some(round.finalize(max_joiners)?),
                RoundPhase::Idle | RoundPhase::Sealed => None,
            };
            if let Some(body) = body {
                self.broadcast(round, body).await;
            }
            self.await_phase(round, phase).await;
        }
        Ok(())
    }

    /// Sends `body` to every other node of the round the limiter allows.
    async fn broadcast(&self, round: &RealmRound, body: PacketBody) {
        let local_id = self.local.node_id;
        let pulse_number = round.pulse_number();
        let packet_type = body.packet_type();

        let targets: Vec<_> = round
            .population()
            .get_any_nodes(true, true)
            .into_iter()
            .filter(|n| n.node_id() != local_id && n.trust_level() != TrustLevel::Fraud)
            .filter(|n| n.set_packet_sent(packet_type))
            .collect();

        let sends = targets.iter().map(|node| {
            let body = body.clone();
            async move {
                let packet = MemberPacket::new(pulse_number, local_id, node.node_id(), body).sign(self.auth.as_ref())?;
                let bytes = self.codec.encode(&packet)?;
                self.transport.send_datagram(&node.profile().address, bytes).await?;
                Ok::<ShortNodeId, ConsensusError>(node.node_id())
            }
        });
        for result in join_all(sends).await {
            if let Err(e) = result {
                debug!("Failed to send {} packet: {}", packet_type, e);
            }
        }
    }

    /// Waits until the phase completes or its timeout passes. Returns
    /// whether it completed.
    async fn await_phase(&self, round: &RealmRound, phase: RoundPhase) -> bool {
        let deadline = Instant::now() + self.config.phase_timeout(phase);
        loop {
            if round.phase_complete(phase) {
                return true;
            }
            if timeout_at(deadline, round.changed()).await.is_err() {
                debug!("Phase {} of pulse {} timed out", phase, round.pulse_number());
                return false;
            }
        }
    }

    fn seal(&self, round: &RealmRound, previous: &PopulationAccessor) -> Result<Report, ConsensusError> {
        let pulse = round.pulse();
        let local_id = self.local.node_id;
        let finalized = round
            .finalized()
            .ok_or_else(|| ConsensusError::InternalInvariant("round sealed without a cloud hash".into()))?;

        let profiles: Vec<Arc<StaticProfile>> = finalized.members.iter().map(|m| Arc::new(m.profile.clone())).collect();
        let (majority, discovery_count) = check_majority_rule(self.certificate.as_ref(), &profiles);
        let min_roles = check_min_role(self.certificate.as_ref(), &profiles);
        let (agreeing, voters) = round.cloud_hash_agreement();
        let agreed = agreeing >= bft_quorum(voters);
        let valid = majority && min_roles && agreed;

        if valid {
            let census = OnlinePopulation::new(finalized.members.clone(), local_id)?;
            self.keeper.sync(pulse, census, Some(finalized.cloud_hash));
        } else {
            let failure = ConsensusError::RoundFailure(format!(
                "majority={majority} discovery={discovery_count} min_roles={min_roles} agreement={agreeing}/{voters}"
            ));
            warn!(target: "consensus", "EVENT:ROUND_FAILED pulse={} {}", pulse.number, failure);
            let mut carried = previous.population.clone();
            carried.set_invalid();
            self.keeper.sync(pulse, carried, None);
        }

        let local = round.population().get_self();
        let (fraud, by_self, by_some, by_neighbors) = round.population().get_trust_counts();
        info!(
            target: "consensus",
            "EVENT:ROUND_SEALED pulse={} members={} valid={} hash={} fraud={} by_self={} by_some={} by_neighbors={}",
            pulse.number,
            finalized.members.len(),
            valid,
            hex::encode(finalized.cloud_hash),
            fraud,
            by_self,
            by_some,
            by_neighbors
        );

        Ok(Report {
            pulse_number: pulse.number,
            member_power: local.power(),
            member_mode: local.mode(),
            is_joiner: false,
            population_valid: valid,
        })
    }

    /// A joiner fetches the sealed census from the members it knows.
    async fn seal_joiner(&self, round: &RealmRound, previous: &PopulationAccessor) -> Report {
        let pulse = round.pulse();
        let local_id = self.local.node_id;
        let local = round.population().get_self();
        let members = previous.population.members();
        let mut obtained = false;

        for attempt in 0..self.config.sync_attempts.max(1) {
            let Some(target) = members.get(attempt % members.len().max(1)) else {
                break;
            };
            match self.sync.request_census(&target.profile, pulse.number).await {
                Ok(reply) if reply.pulse.number >= pulse.number => {
                    let admitted = reply.members.iter().any(|m| m.profile.node_id == local_id);
                    let census = if admitted {
                        OnlinePopulation::new(reply.members, local_id)
                    } else {
                        OnlinePopulation::without_local(reply.members)
                    };
                    match census {
                        Ok(census) => {
                            self.keeper.sync(reply.pulse, census, reply.cloud_hash);
                            info!(
                                target: "consensus",
                                "EVENT:JOINER_SYNCED pulse={} node={} admitted={} from={}",
                                reply.pulse.number,
                                local_id,
                                admitted,
                                target.profile.node_id
                            );
                            obtained = true;
                            break;
                        }
                        Err(e) => warn!("Census from node {} rejected: {}", target.profile.node_id, e),
                    }
                }
                Ok(reply) => {
                    debug!(
                        "Node {} has not sealed pulse {} yet (at {})",
                        target.profile.node_id, pulse.number, reply.pulse.number
                    );
                    sleep(self.config.phase_timeout(RoundPhase::Announcing)).await;
                }
                Err(e) => debug!("Census sync with node {} failed: {}", target.profile.node_id, e),
            }
        }
        if !obtained {
            warn!(target: "consensus", "EVENT:JOINER_SYNC_FAILED pulse={} node={}", pulse.number, local_id);
        }

        Report {
            pulse_number: pulse.number,
            member_power: local.power(),
            member_mode: local.mode(),
            is_joiner: true,
            population_valid: obtained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::PrimaryRole;
    use crate::rules::{DiscoveryNode, MinRoles, StaticCertificate};
    use crate::storage::InMemoryPulseStorage;
    use pulsenet_common::auth::ed25519::Ed25519Authenticator;
    use pulsenet_common::{Bits256, PulseNumber};
    use pulsenet_p2p::InMemoryHub;

    fn controller(config: ConsensusConfig) -> RoundController {
        let hub = InMemoryHub::new();
        let auth = Arc::new(Ed25519Authenticator::generate());
        let profile = Arc::new(StaticProfile::new(ShortNodeId(1), PrimaryRole::Virtual, auth.public_key(), "node-1"));
        let certificate = Arc::new(StaticCertificate {
            discovery_nodes: vec![DiscoveryNode {
                node_id: ShortNodeId(1),
                role: PrimaryRole::Virtual,
                address: "node-1".into(),
                public_key: auth.public_key(),
            }],
            majority_rule: 1,
            min_roles: MinRoles::default(),
        });
        let keeper = Arc::new(PopulationKeeper::new(Arc::clone(&profile), 4));
        keeper
            .set_initial_snapshot(PulseData::new_first_ephemeral(), certificate.initial_census())
            .unwrap();
        RoundController::new(
            config,
            profile,
            auth,
            Arc::new(hub.connect("node-1")),
            keeper,
            certificate,
            Arc::new(InMemoryPulseStorage::new()),
        )
    }

    fn ephemeral_after(pulse: PulseData, steps: usize) -> PulseData {
        (0..steps).fold(pulse, |p, _| p.create_next_ephemeral_pulse().unwrap())
    }

    #[test]
    fn test_peer_pulse_catch_up_is_bounded() {
        let controller = controller(ConsensusConfig {
            ephemeral: true,
            max_pulse_catch_up: 4,
            ..ConsensusConfig::default()
        });
        let first = PulseData::new_first_ephemeral();
        assert!(controller.is_reachable_ephemeral(&ephemeral_after(first, 1)));
        assert!(controller.is_reachable_ephemeral(&ephemeral_after(first, 4)));
        assert!(!controller.is_reachable_ephemeral(&ephemeral_after(first, 5)));

        // Same number, not the pulse our chain produces.
        let mut forged = ephemeral_after(first, 2);
        forged.entropy = Bits256::random();
        assert!(!controller.is_reachable_ephemeral(&forged));

        let pulsar = PulseData::new_first_pulsar(10, Bits256::random()).unwrap();
        assert!(!controller.is_reachable_ephemeral(&pulsar));

        // The window moves with the last sealed pulse.
        *lock(&controller.last_pulse) = Some(ephemeral_after(first, 4));
        assert!(controller.is_reachable_ephemeral(&ephemeral_after(first, 8)));
    }

    #[test]
    fn test_pulsar_pulse_must_chain() {
        let controller = controller(ConsensusConfig::default());
        let first = PulseData::new_first_pulsar(10, Bits256::random()).unwrap();
        assert!(controller.accept_pulsar_pulse(&first));
        assert!(!controller.accept_pulsar_pulse(&ephemeral_after(PulseData::new_first_ephemeral(), 1)));
        *lock(&controller.last_pulse) = Some(first);

        let next = first.create_next_pulsar_pulse(10, Bits256::random).unwrap();
        assert!(controller.accept_pulsar_pulse(&next));
        assert!(!controller.accept_pulsar_pulse(&first));

        let wrong_delta = PulseData::new_pulsar(PulseNumber::new(first.number.as_u32() + 5), 10, 5, Bits256::random()).unwrap();
        assert!(!controller.accept_pulsar_pulse(&wrong_delta));

        // A gap restarts the chain.
        let later = PulseData::new_pulsar(PulseNumber::new(first.number.as_u32() + 100), 10, 10, Bits256::random()).unwrap();
        assert!(controller.accept_pulsar_pulse(&later));
    }
}
