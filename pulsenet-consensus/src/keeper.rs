//! Pulse-keyed history of sealed censuses, cloud hashes and node routing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use pulsenet_common::{NodeRef, PulseData, PulseNetError, PulseNumber, ShortNodeId};

use crate::census::{ActiveMember, CensusMember, OnlinePopulation};
use crate::error::ConsensusError;
use crate::profile::StaticProfile;

/// Read-only view of the census sealed for one pulse.
#[derive(Debug)]
pub struct PopulationAccessor {
    pub pulse: PulseData,
    pub population: OnlinePopulation,
    pub cloud_hash: Option<[u8; 32]>,
}

impl PopulationAccessor {
    pub fn get_active_node(&self, node_ref: &NodeRef) -> Option<&ActiveMember> {
        self.population.get_member_by_ref(node_ref)
    }

    pub fn get_active_node_by_short_id(&self, id: ShortNodeId) -> Option<&ActiveMember> {
        self.population.get_member(id)
    }

    pub fn get_active_nodes(&self) -> &[ActiveMember] {
        self.population.members()
    }

    /// Members that hold power and are not suspended.
    pub fn get_working_nodes(&self) -> Vec<&ActiveMember> {
        self.population
            .members()
            .iter()
            .filter(|m| !m.is_idle() && m.mode.can_vote())
            .collect()
    }
}

#[derive(Debug, Default)]
struct History {
    accessors: BTreeMap<PulseNumber, Arc<PopulationAccessor>>,
    cloud_hashes: BTreeMap<PulseNumber, [u8; 32]>,
}

pub struct PopulationKeeper {
    origin: Arc<StaticProfile>,
    max_history: usize,
    history: RwLock<History>,
    temporary: RwLock<HashMap<NodeRef, (ShortNodeId, String)>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl PopulationKeeper {
    pub fn new(origin: Arc<StaticProfile>, max_history: usize) -> Self {
        Self {
            origin,
            max_history: max_history.max(1),
            history: RwLock::new(History::default()),
            temporary: RwLock::new(HashMap::new()),
        }
    }

    pub fn origin(&self) -> &Arc<StaticProfile> {
        &self.origin
    }

    /// Census the node starts from, before its first round.
    pub fn set_initial_snapshot(&self, pulse: PulseData, members: Vec<CensusMember>) -> Result<(), ConsensusError> {
        let population = if members.iter().any(|m| m.profile.node_id == self.origin.node_id) {
            OnlinePopulation::new(members, self.origin.node_id)?
        } else {
            OnlinePopulation::without_local(members)?
        };
        self.sync(pulse, population, None);
        Ok(())
    }

    /// Stores the census sealed for `pulse`, dropping the oldest entries
    /// beyond the history bound.
    pub fn sync(&self, pulse: PulseData, population: OnlinePopulation, cloud_hash: Option<[u8; 32]>) {
        let mut history = write(&self.history);
        let accessor = Arc::new(PopulationAccessor {
            pulse,
            population,
            cloud_hash,
        });
        history.accessors.insert(pulse.number, accessor);
        if let Some(hash) = cloud_hash {
            history.cloud_hashes.insert(pulse.number, hash);
        }
        while history.accessors.len() > self.max_history {
            history.accessors.pop_first();
        }
        while history.cloud_hashes.len() > self.max_history {
            history.cloud_hashes.pop_first();
        }
        debug!("Keeper synced pulse {}", pulse.number);
    }

    pub fn get_accessor(&self, pulse: PulseNumber) -> Option<Arc<PopulationAccessor>> {
        read(&self.history).accessors.get(&pulse).cloned()
    }

    pub fn latest_accessor(&self) -> Option<Arc<PopulationAccessor>> {
        read(&self.history).accessors.values().next_back().cloned()
    }

    pub fn set_cloud_hash(&self, pulse: PulseNumber, hash: [u8; 32]) {
        let mut history = write(&self.history);
        history.cloud_hashes.insert(pulse, hash);
        while history.cloud_hashes.len() > self.max_history {
            history.cloud_hashes.pop_first();
        }
    }

    pub fn get_cloud_hash(&self, pulse: PulseNumber) -> Option<[u8; 32]> {
        read(&self.history).cloud_hashes.get(&pulse).copied()
    }

    /// Maps a node not yet in any census, such as a joiner being admitted.
    pub fn add_temporary_mapping(&self, node_ref: NodeRef, id: ShortNodeId, address: impl Into<String>) {
        write(&self.temporary).insert(node_ref, (id, address.into()));
    }

    pub fn remove_temporary_mapping(&self, node_ref: &NodeRef) {
        write(&self.temporary).remove(node_ref);
    }

    /// Short id and address of a node: latest census first, then the
    /// temporary mappings.
    pub fn resolve(&self, node_ref: &NodeRef) -> Result<(ShortNodeId, String), ConsensusError> {
        if let Some(accessor) = self.latest_accessor() {
            if let Some(member) = accessor.get_active_node(node_ref) {
                return Ok((member.node_id(), member.profile.address.clone()));
            }
        }
        read(&self.temporary)
            .get(node_ref)
            .cloned()
            .ok_or_else(|| PulseNetError::Network(format!("failed to resolve node {node_ref}")).into())
    }

    pub fn resolve_short(&self, id: ShortNodeId) -> Result<(NodeRef, String), ConsensusError> {
        if let Some(accessor) = self.latest_accessor() {
            if let Some(member) = accessor.get_active_node_by_short_id(id) {
                return Ok((member.profile.node_ref, member.profile.address.clone()));
            }
        }
        read(&self.temporary)
            .iter()
            .find(|(_, (short, _))| *short == id)
            .map(|(node_ref, (_, address))| (*node_ref, address.clone()))
            .ok_or_else(|| PulseNetError::Network(format!("failed to resolve node {id}")).into())
    }
}
