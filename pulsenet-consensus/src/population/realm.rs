//! Working set of one round: indexed members carried over from the census,
//! joiners, and nodes admitted from the purgatory while the round runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::seq::SliceRandom;

use pulsenet_common::ShortNodeId;

use crate::census::OnlinePopulation;
use crate::error::ConsensusError;
use crate::member::{OpMode, PrimaryRole, Rank};
use crate::packet::PacketLimiter;
use crate::population::{NodeAppearance, TrustLevel, VectorHelper};
use crate::profile::StaticProfile;

/// What a short id refers to in this round.
#[derive(Debug, Clone)]
pub enum MemberRecord {
    Indexed(Arc<NodeAppearance>),
    Joiner(Arc<NodeAppearance>),
    /// Slot claimed for a node about to be admitted.
    Reserved(ShortNodeId),
}

#[derive(Debug, Default)]
struct PopulationState {
    indexed: Vec<Arc<NodeAppearance>>,
    sealed_capacity: Option<usize>,
    joiners: BTreeMap<ShortNodeId, Arc<NodeAppearance>>,
    dynamics: BTreeMap<ShortNodeId, Arc<NodeAppearance>>,
    reservations: BTreeMap<ShortNodeId, Option<Arc<NodeAppearance>>>,
}

impl PopulationState {
    fn find(&self, id: ShortNodeId) -> Option<&Arc<NodeAppearance>> {
        self.indexed
            .iter()
            .find(|n| n.node_id() == id)
            .or_else(|| self.joiners.get(&id))
            .or_else(|| self.dynamics.get(&id))
    }
}

#[derive(Debug, Default)]
struct Counters {
    fraud: AtomicU16,
    by_self: AtomicU16,
    by_some: AtomicU16,
    by_neighbors: AtomicU16,
    brief: AtomicU16,
    full: AtomicU16,
    purgatory_added: AtomicU16,
    purgatory_ascent: AtomicU16,
}

/// Counts one more, sticking at the maximum instead of wrapping.
fn bump(counter: &AtomicU16) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1));
}

#[derive(Debug)]
pub struct RealmPopulation {
    local: Arc<NodeAppearance>,
    state: RwLock<PopulationState>,
    counters: Counters,
}

impl RealmPopulation {
    /// Builds the round population from the previous census and the joiners
    /// confirmed for this round. The local node must be one of them.
    pub fn new(
        census: &OnlinePopulation,
        joiners: Vec<Arc<StaticProfile>>,
        local_id: ShortNodeId,
    ) -> Result<Self, ConsensusError> {
        if census.indexed_count() == 0 && joiners.is_empty() {
            return Err(ConsensusError::InternalInvariant("empty population".into()));
        }
        let count = u16::try_from(census.indexed_count())
            .map_err(|_| ConsensusError::InternalInvariant("population too large".into()))?;

        let mut state = PopulationState::default();
        for member in census.members() {
            let rank = Rank::new(member.profile.primary_role, member.power, member.index, count);
            state.indexed.push(Arc::new(NodeAppearance::new(
                Arc::clone(&member.profile),
                rank,
                member.power,
                member.mode,
                PacketLimiter::new(false),
            )));
        }
        for profile in joiners {
            let id = profile.node_id;
            if state.find(id).is_some() {
                return Err(ConsensusError::InternalInvariant(format!("joiner {id} is already a member")));
            }
            let power = profile.startup_power();
            let appearance = NodeAppearance::new(profile, Rank::joiner(), power, OpMode::Normal, PacketLimiter::new(true));
            state.joiners.insert(id, Arc::new(appearance));
        }

        let local = state
            .find(local_id)
            .cloned()
            .ok_or_else(|| ConsensusError::InternalInvariant(format!("local node {local_id} is not in the population")))?;

        let population = Self {
            local,
            state: RwLock::new(state),
            counters: Counters::default(),
        };
        population.update_trust(&population.local, TrustLevel::BySelf);
        Ok(population)
    }

    fn read(&self) -> RwLockReadGuard<'_, PopulationState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PopulationState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn local_id(&self) -> ShortNodeId {
        self.local.node_id()
    }

    pub fn get_self(&self) -> Arc<NodeAppearance> {
        Arc::clone(&self.local)
    }

    /// Fixes the number of indexed members. Fails, leaving the population
    /// untouched, when already sealed or when `capacity` does not match.
    pub fn seal_indexed(&self, capacity: usize) -> Result<(), ConsensusError> {
        let mut state = self.write();
        if let Some(sealed) = state.sealed_capacity {
            return Err(ConsensusError::InternalInvariant(format!(
                "population already sealed with capacity {sealed}"
            )));
        }
        if capacity != state.indexed.len() {
            return Err(ConsensusError::InternalInvariant(format!(
                "seal capacity {capacity} does not match {} indexed members",
                state.indexed.len()
            )));
        }
        state.sealed_capacity = Some(capacity);
        Ok(())
    }

    pub fn get_sealed_capacity(&self) -> Option<usize> {
        self.read().sealed_capacity
    }

    /// Claims the slot for `id`. Returns `(true, None)` for a new claim and
    /// `(false, existing)` when the id is already a member or reserved.
    pub fn add_reservation(&self, id: ShortNodeId) -> (bool, Option<Arc<NodeAppearance>>) {
        let mut state = self.write();
        if let Some(existing) = state.find(id) {
            return (false, Some(Arc::clone(existing)));
        }
        if let Some(reserved) = state.reservations.get(&id) {
            return (false, reserved.clone());
        }
        state.reservations.insert(id, None);
        (true, None)
    }

    /// Returns whether `id` is reserved and the node that took the slot, if any.
    pub fn find_reservation(&self, id: ShortNodeId) -> (bool, Option<Arc<NodeAppearance>>) {
        match self.read().reservations.get(&id) {
            Some(slot) => (true, slot.clone()),
            None => (false, None),
        }
    }

    /// Admits a node during the round. After the seal only reserved ids can
    /// be admitted. Admitting an existing member returns that member.
    pub fn add_to_dynamics(&self, node: Arc<NodeAppearance>) -> Result<Arc<NodeAppearance>, ConsensusError> {
        let id = node.node_id();
        let mut state = self.write();
        if let Some(existing) = state.find(id) {
            return Ok(Arc::clone(existing));
        }
        if state.sealed_capacity.is_some() {
            match state.reservations.get_mut(&id) {
                Some(slot) => *slot = Some(Arc::clone(&node)),
                None => {
                    return Err(ConsensusError::InternalInvariant(format!(
                        "node {id} admitted after seal without a reservation"
                    )))
                }
            }
        }
        if node.is_joiner() {
            state.joiners.insert(id, Arc::clone(&node));
        } else {
            state.dynamics.insert(id, Arc::clone(&node));
        }
        drop(state);

        if node.profile().is_full() {
            bump(&self.counters.full);
        } else {
            bump(&self.counters.brief);
        }
        Ok(node)
    }

    pub fn get_member(&self, id: ShortNodeId) -> Option<MemberRecord> {
        let state = self.read();
        if let Some(n) = state.indexed.iter().find(|n| n.node_id() == id) {
            return Some(MemberRecord::Indexed(Arc::clone(n)));
        }
        if let Some(n) = state.joiners.get(&id) {
            return Some(MemberRecord::Joiner(Arc::clone(n)));
        }
        if let Some(n) = state.dynamics.get(&id) {
            return Some(MemberRecord::Indexed(Arc::clone(n)));
        }
        state.reservations.get(&id).map(|_| MemberRecord::Reserved(id))
    }

    pub fn get_node_appearance(&self, id: ShortNodeId) -> Option<Arc<NodeAppearance>> {
        self.read().find(id).cloned()
    }

    /// Non-joiner members only.
    pub fn get_active_node_appearance(&self, id: ShortNodeId) -> Option<Arc<NodeAppearance>> {
        let state = self.read();
        state
            .indexed
            .iter()
            .find(|n| n.node_id() == id)
            .or_else(|| state.dynamics.get(&id))
            .cloned()
    }

    pub fn get_joiner_node_appearance(&self, id: ShortNodeId) -> Option<Arc<NodeAppearance>> {
        self.read().joiners.get(&id).cloned()
    }

    pub fn get_node_appearance_by_index(&self, index: usize) -> Option<Arc<NodeAppearance>> {
        self.read().indexed.get(index).cloned()
    }

    pub fn get_indexed_count(&self) -> usize {
        self.read().indexed.len()
    }

    pub fn get_joiners_count(&self) -> usize {
        self.read().joiners.len()
    }

    pub fn get_indexed_nodes(&self) -> Vec<Arc<NodeAppearance>> {
        self.read().indexed.clone()
    }

    pub fn get_joiners(&self) -> Vec<Arc<NodeAppearance>> {
        self.read().joiners.values().cloned().collect()
    }

    /// Members other than the local node, joiners excluded, in random order.
    pub fn get_shuffled_other_nodes(&self) -> Vec<Arc<NodeAppearance>> {
        let local_id = self.local_id();
        let mut nodes: Vec<_> = {
            let state = self.read();
            state
                .indexed
                .iter()
                .chain(state.dynamics.values())
                .filter(|n| n.node_id() != local_id)
                .cloned()
                .collect()
        };
        nodes.shuffle(&mut rand::thread_rng());
        nodes
    }

    /// Nodes admitted during the round, optionally with the indexed members.
    pub fn get_any_nodes(&self, include_indexed: bool, shuffle: bool) -> Vec<Arc<NodeAppearance>> {
        let mut nodes: Vec<_> = {
            let state = self.read();
            let indexed = if include_indexed { state.indexed.as_slice() } else { &[] };
            indexed
                .iter()
                .chain(state.dynamics.values())
                .chain(state.joiners.values())
                .cloned()
                .collect()
        };
        if shuffle {
            nodes.shuffle(&mut rand::thread_rng());
        }
        nodes
    }

    /// Member count and whether the indexed set is final.
    pub fn get_count_and_completeness(&self, include_joiners: bool) -> (usize, bool) {
        let state = self.read();
        let mut count = state.indexed.len() + state.dynamics.len();
        if include_joiners {
            count += state.joiners.len();
        }
        (count, state.sealed_capacity.is_some())
    }

    pub fn get_role_members(&self, role: PrimaryRole) -> Vec<Arc<NodeAppearance>> {
        self.read()
            .indexed
            .iter()
            .filter(|n| n.rank().role == role)
            .cloned()
            .collect()
    }

    pub fn create_packet_limiter(&self, is_joiner: bool) -> PacketLimiter {
        PacketLimiter::new(is_joiner)
    }

    pub fn create_vector_helper(&self) -> VectorHelper {
        VectorHelper::new(&self.get_any_nodes(true, false))
    }

    /// Raises a node's trust and counts the transition.
    pub fn update_trust(&self, node: &NodeAppearance, level: TrustLevel) -> bool {
        if !node.raise_trust(level) {
            return false;
        }
        match level {
            TrustLevel::BySelf => bump(&self.counters.by_self),
            TrustLevel::BySome => bump(&self.counters.by_some),
            TrustLevel::ByNeighbors => bump(&self.counters.by_neighbors),
            TrustLevel::Fraud | TrustLevel::Unknown => {}
        }
        true
    }

    pub fn mark_fraud(&self, node: &NodeAppearance) -> bool {
        if !node.mark_fraud() {
            return false;
        }
        bump(&self.counters.fraud);
        true
    }

    /// `(fraud, by_self, by_some, by_neighbors)`.
    pub fn get_trust_counts(&self) -> (u16, u16, u16, u16) {
        let c = &self.counters;
        (
            c.fraud.load(Ordering::Relaxed),
            c.by_self.load(Ordering::Relaxed),
            c.by_some.load(Ordering::Relaxed),
            c.by_neighbors.load(Ordering::Relaxed),
        )
    }

    /// `(brief, full)` profiles admitted during the round.
    pub fn get_dynamic_counts(&self) -> (u16, u16) {
        (
            self.counters.brief.load(Ordering::Relaxed),
            self.counters.full.load(Ordering::Relaxed),
        )
    }

    /// `(added, ascended)` phantoms.
    pub fn get_purgatory_counts(&self) -> (u16, u16) {
        (
            self.counters.purgatory_added.load(Ordering::Relaxed),
            self.counters.purgatory_ascent.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn on_purgatory_added(&self) {
        bump(&self.counters.purgatory_added);
    }

    pub(crate) fn on_purgatory_ascent(&self) {
        bump(&self.counters.purgatory_ascent);
    }
}
