use std::sync::Arc;

use pulsenet_common::crypto::hash::digest_parts;
use pulsenet_common::ShortNodeId;

use crate::population::{NodeAppearance, TrustLevel};

/// Frozen view of which nodes the local node has evidence for, used to
/// build the vector packet.
#[derive(Debug, Clone)]
pub struct VectorHelper {
    entries: Vec<(ShortNodeId, TrustLevel)>,
}

impl VectorHelper {
    pub(crate) fn new(nodes: &[Arc<NodeAppearance>]) -> Self {
        let mut entries: Vec<_> = nodes.iter().map(|n| (n.node_id(), n.trust_level())).collect();
        entries.sort_by_key(|(id, _)| *id);
        Self { entries }
    }

    /// Nodes with any positive evidence, direct or reported.
    pub fn seen_ids(&self) -> Vec<ShortNodeId> {
        self.entries
            .iter()
            .filter(|(_, trust)| *trust >= TrustLevel::BySelf)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn trust_of(&self, id: ShortNodeId) -> Option<TrustLevel> {
        self.entries.iter().find(|(n, _)| *n == id).map(|(_, t)| *t)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn digest(&self) -> [u8; 32] {
        let parts: Vec<[u8; 5]> = self
            .entries
            .iter()
            .map(|(id, trust)| {
                let mut part = [0u8; 5];
                part[..4].copy_from_slice(&id.0.to_le_bytes());
                part[4] = *trust as u8;
                part
            })
            .collect();
        digest_parts(parts.iter().map(|p| p.as_slice()))
    }
}
