//! Sealed working set of one pulse.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use pulsenet_common::{NodeRef, ShortNodeId};

use crate::error::ConsensusError;
use crate::member::{OpMode, Power, PrimaryRole};
use crate::profile::StaticProfile;

/// Census entry as stored and sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusMember {
    pub profile: StaticProfile,
    pub power: Power,
    pub mode: OpMode,
}

impl CensusMember {
    pub fn new(profile: StaticProfile, power: Power, mode: OpMode) -> Self {
        Self { profile, power, mode }
    }

    /// Entry for a node entering with its startup power.
    pub fn joining(profile: StaticProfile) -> Self {
        let power = profile.startup_power();
        Self::new(profile, power, OpMode::Normal)
    }
}

#[derive(Debug, Clone)]
pub struct ActiveMember {
    pub profile: Arc<StaticProfile>,
    pub power: Power,
    pub mode: OpMode,
    pub index: u16,
}

impl ActiveMember {
    pub fn node_id(&self) -> ShortNodeId {
        self.profile.node_id
    }

    /// Idle members hold no power or declare no working role.
    pub fn is_idle(&self) -> bool {
        self.power.is_zero() || !self.profile.primary_role.is_working()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RolePopulation {
    pub role: PrimaryRole,
    pub members: Vec<ShortNodeId>,
    pub total_power: u32,
}

#[derive(Debug, Clone)]
pub struct OnlinePopulation {
    members: Vec<ActiveMember>,
    by_id: HashMap<ShortNodeId, usize>,
    by_ref: HashMap<NodeRef, usize>,
    local: Option<usize>,
    roles: BTreeMap<PrimaryRole, RolePopulation>,
    idle_count: usize,
    suspended_count: usize,
    mistrusted_count: usize,
    is_valid: bool,
}

impl OnlinePopulation {
    /// Builds the census seen by `local_id`, which must be a member.
    pub fn new(members: Vec<CensusMember>, local_id: ShortNodeId) -> Result<Self, ConsensusError> {
        let population = Self::build(members)?;
        match population.by_id.get(&local_id).copied() {
            Some(index) => Ok(Self {
                local: Some(index),
                ..population
            }),
            None => Err(ConsensusError::InternalInvariant(format!(
                "local node {local_id} is not in the population"
            ))),
        }
    }

    /// Census seen from outside, by a node that is not (yet) a member.
    pub fn without_local(members: Vec<CensusMember>) -> Result<Self, ConsensusError> {
        Self::build(members)
    }

    fn build(mut members: Vec<CensusMember>) -> Result<Self, ConsensusError> {
        if members.is_empty() {
            return Err(ConsensusError::InternalInvariant("empty population".into()));
        }
        members.sort_by_key(|m| (m.profile.primary_role, m.profile.node_id));

        let mut by_id = HashMap::with_capacity(members.len());
        let mut by_ref = HashMap::with_capacity(members.len());
        let mut roles: BTreeMap<PrimaryRole, RolePopulation> = BTreeMap::new();
        let mut active = Vec::with_capacity(members.len());
        let (mut idle_count, mut suspended_count, mut mistrusted_count) = (0, 0, 0);

        for (index, member) in members.into_iter().enumerate() {
            let node_id = member.profile.node_id;
            if node_id.is_absent() {
                return Err(ConsensusError::InternalInvariant("member with absent id".into()));
            }
            if by_id.insert(node_id, index).is_some() {
                return Err(ConsensusError::InternalInvariant(format!("duplicate member id {node_id}")));
            }
            by_ref.insert(member.profile.node_ref, index);

            let entry = ActiveMember {
                profile: Arc::new(member.profile),
                power: member.power,
                mode: member.mode,
                index: u16::try_from(index)
                    .map_err(|_| ConsensusError::InternalInvariant("population too large".into()))?,
            };
            if entry.mode.is_suspended() {
                suspended_count += 1;
            }
            if entry.mode.is_mistrustful() {
                mistrusted_count += 1;
            }

            // Idle members are bucketed as inactive whatever role they declare.
            let bucket = if entry.is_idle() {
                idle_count += 1;
                PrimaryRole::Inactive
            } else {
                entry.profile.primary_role
            };
            let role = roles.entry(bucket).or_insert_with(|| RolePopulation {
                role: bucket,
                ..RolePopulation::default()
            });
            role.members.push(node_id);
            if entry.mode.can_vote() {
                role.total_power += u32::from(entry.power.0);
            }
            active.push(entry);
        }

        Ok(Self {
            members: active,
            by_id,
            by_ref,
            local: None,
            roles,
            idle_count,
            suspended_count,
            mistrusted_count,
            is_valid: true,
        })
    }

    pub fn indexed_count(&self) -> usize {
        self.members.len()
    }

    pub fn indexed_capacity(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[ActiveMember] {
        &self.members
    }

    pub fn get_member(&self, id: ShortNodeId) -> Option<&ActiveMember> {
        self.by_id.get(&id).map(|i| &self.members[*i])
    }

    pub fn get_member_by_ref(&self, node_ref: &NodeRef) -> Option<&ActiveMember> {
        self.by_ref.get(node_ref).map(|i| &self.members[*i])
    }

    pub fn get_by_index(&self, index: usize) -> Option<&ActiveMember> {
        self.members.get(index)
    }

    pub fn local(&self) -> Option<&ActiveMember> {
        self.local.map(|i| &self.members[i])
    }

    pub fn role_population(&self, role: PrimaryRole) -> Option<&RolePopulation> {
        self.roles.get(&role)
    }

    /// Roles with at least one powered member, in priority order.
    pub fn working_roles(&self) -> Vec<PrimaryRole> {
        self.roles.keys().copied().filter(|r| r.is_working()).collect()
    }

    pub fn idle_profiles(&self) -> Vec<Arc<StaticProfile>> {
        self.members
            .iter()
            .filter(|m| m.is_idle())
            .map(|m| Arc::clone(&m.profile))
            .collect()
    }

    pub fn idle_count(&self) -> usize {
        self.idle_count
    }

    pub fn suspended_count(&self) -> usize {
        self.suspended_count
    }

    pub fn mistrusted_count(&self) -> usize {
        self.mistrusted_count
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn set_invalid(&mut self) {
        self.is_valid = false;
    }

    pub fn profiles(&self) -> Vec<Arc<StaticProfile>> {
        self.members.iter().map(|m| Arc::clone(&m.profile)).collect()
    }

    pub fn to_census_members(&self) -> Vec<CensusMember> {
        self.members
            .iter()
            .map(|m| CensusMember::new(m.profile.as_ref().clone(), m.power, m.mode))
            .collect()
    }
}
