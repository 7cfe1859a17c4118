//! Network-level admission rules checked when a round is sealed.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use pulsenet_common::{NodeRef, ShortNodeId};

use crate::census::CensusMember;
use crate::member::{OpMode, Power, PrimaryRole};
use crate::profile::StaticProfile;

/// A well-known node that bootstraps the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub node_id: ShortNodeId,
    pub role: PrimaryRole,
    pub address: String,
    #[serde(with = "hex")]
    pub public_key: Vec<u8>,
}

impl DiscoveryNode {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef::from_public_key(&self.public_key)
    }

    pub fn profile(&self) -> StaticProfile {
        StaticProfile::new(self.node_id, self.role, self.public_key.clone(), self.address.clone())
    }
}

/// Minimum number of members per working role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinRoles {
    #[serde(default)]
    pub virtual_nodes: usize,
    #[serde(default)]
    pub heavy_material: usize,
    #[serde(default)]
    pub light_material: usize,
}

pub trait Certificate: Send + Sync {
    fn discovery_nodes(&self) -> &[DiscoveryNode];

    /// How many discovery nodes must be present for a valid population.
    fn majority_rule(&self) -> usize;

    fn min_roles(&self) -> MinRoles;

    /// Census every node starts from: the discovery nodes at default power.
    fn initial_census(&self) -> Vec<CensusMember> {
        self.discovery_nodes()
            .iter()
            .map(|d| CensusMember::new(d.profile(), Power::DEFAULT, OpMode::Normal))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCertificate {
    pub discovery_nodes: Vec<DiscoveryNode>,
    pub majority_rule: usize,
    #[serde(default)]
    pub min_roles: MinRoles,
}

impl Certificate for StaticCertificate {
    fn discovery_nodes(&self) -> &[DiscoveryNode] {
        &self.discovery_nodes
    }

    fn majority_rule(&self) -> usize {
        self.majority_rule
    }

    fn min_roles(&self) -> MinRoles {
        self.min_roles
    }
}

/// Counts discovery nodes among `nodes`; the rule holds when the count
/// reaches the certificate's majority rule.
pub fn check_majority_rule(cert: &dyn Certificate, nodes: &[Arc<StaticProfile>]) -> (bool, usize) {
    let discovery: HashSet<NodeRef> = cert.discovery_nodes().iter().map(DiscoveryNode::node_ref).collect();
    let count = nodes.iter().filter(|n| discovery.contains(&n.node_ref)).count();
    (count >= cert.majority_rule(), count)
}

pub fn check_min_role(cert: &dyn Certificate, nodes: &[Arc<StaticProfile>]) -> bool {
    let min = cert.min_roles();
    let count = |role: PrimaryRole| nodes.iter().filter(|n| n.primary_role == role).count();
    count(PrimaryRole::Virtual) >= min.virtual_nodes
        && count(PrimaryRole::HeavyMaterial) >= min.heavy_material
        && count(PrimaryRole::LightMaterial) >= min.light_material
}

/// Votes needed among `n` participants to tolerate `(n - 1) / 3` faults.
pub fn bft_quorum(n: usize) -> usize {
    let f = n.saturating_sub(1) / 3;
    2 * f + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, role: PrimaryRole) -> DiscoveryNode {
        DiscoveryNode {
            node_id: ShortNodeId(id),
            role,
            address: "127.0.0.1:3000".into(),
            public_key: vec![id as u8; 32],
        }
    }

    fn cert(count: u32, majority_rule: usize) -> StaticCertificate {
        StaticCertificate {
            discovery_nodes: (1..=count).map(|i| node(i, PrimaryRole::Virtual)).collect(),
            majority_rule,
            min_roles: MinRoles::default(),
        }
    }

    fn profiles(ids: impl IntoIterator<Item = u32>) -> Vec<Arc<StaticProfile>> {
        ids.into_iter().map(|i| Arc::new(node(i, PrimaryRole::Virtual).profile())).collect()
    }

    #[test]
    fn test_check_majority_rule() {
        let cert = cert(5, 4);
        let mut nodes = profiles(1..=5);
        nodes.push(Arc::new(node(250, PrimaryRole::Virtual).profile()));
        assert_eq!(check_majority_rule(&cert, &nodes), (true, 5));

        assert_eq!(check_majority_rule(&cert, &profiles(1..=4)), (true, 4));
        assert_eq!(check_majority_rule(&cert, &profiles(1..=3)), (false, 3));
        assert_eq!(check_majority_rule(&cert, &profiles([250, 251])), (false, 0));
    }

    #[test]
    fn test_check_min_role() {
        let nodes: Vec<_> = [
            (1, PrimaryRole::HeavyMaterial),
            (2, PrimaryRole::LightMaterial),
            (3, PrimaryRole::LightMaterial),
            (4, PrimaryRole::Virtual),
            (5, PrimaryRole::Virtual),
        ]
        .into_iter()
        .map(|(id, role)| Arc::new(node(id, role).profile()))
        .collect();

        let mut cert = cert(0, 0);
        cert.min_roles = MinRoles {
            virtual_nodes: 1,
            heavy_material: 0,
            light_material: 0,
        };
        assert!(check_min_role(&cert, &nodes));

        cert.min_roles.heavy_material = 2;
        assert!(!check_min_role(&cert, &nodes));
    }

    #[test]
    fn test_bft_quorum() {
        assert_eq!(bft_quorum(1), 1);
        assert_eq!(bft_quorum(3), 1);
        assert_eq!(bft_quorum(4), 3);
        assert_eq!(bft_quorum(7), 5);
    }

    #[test]
    fn test_certificate_json() {
        let cert = cert(2, 2);
        let json = serde_json::to_string(&cert).unwrap();
        assert!(json.contains(&hex::encode([1u8; 32])));
        let parsed: StaticCertificate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cert);
        assert_eq!(parsed.initial_census().len(), 2);
    }
}
