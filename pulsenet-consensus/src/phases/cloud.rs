//! Deterministic digests every member computes the same way.

use pulsenet_common::crypto::hash::{digest_bytes, digest_parts};
use pulsenet_common::{Bits256, NodeRef, PulseNumber, ShortNodeId};

use crate::census::CensusMember;

pub fn entropy_commitment(entropy: &Bits256) -> [u8; 32] {
    digest_bytes(entropy.as_bytes())
}

/// Pulse entropy XOR every revealed contribution. Independent of the order
/// the reveals arrived in.
pub fn combine_entropy(pulse_entropy: Bits256, reveals: &[(ShortNodeId, Bits256)]) -> Bits256 {
    let mut sorted = reveals.to_vec();
    sorted.sort_by_key(|(id, _)| *id);
    sorted.into_iter().fold(pulse_entropy, |acc, (_, e)| acc ^ e)
}

/// Digest over the pulse number, the combined entropy and the members
/// sorted by short id.
pub fn compute_cloud_hash(pulse: PulseNumber, entropy: &Bits256, members: &[CensusMember]) -> [u8; 32] {
    let mut sorted: Vec<&CensusMember> = members.iter().collect();
    sorted.sort_by_key(|m| m.profile.node_id);

    let header = pulse.as_u32().to_le_bytes();
    let rows: Vec<Vec<u8>> = sorted
        .iter()
        .map(|m| {
            let mut row = Vec::with_capacity(39);
            row.extend_from_slice(&m.profile.node_id.0.to_le_bytes());
            row.extend_from_slice(m.profile.node_ref.as_bytes());
            row.push(m.profile.primary_role.as_u8());
            row.push(m.power.0);
            row.push(m.mode.as_u8());
            row
        })
        .collect();

    digest_parts(
        [header.as_slice(), entropy.as_bytes().as_slice()]
            .into_iter()
            .chain(rows.iter().map(Vec::as_slice)),
    )
}

/// Priority of a join claim. Lower wins.
pub fn join_priority(node_ref: &NodeRef, entropy: &Bits256) -> [u8; 32] {
    node_ref.xor_entropy(entropy)
}
