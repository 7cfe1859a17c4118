use serde::{Deserialize, Serialize};

use pulsenet_common::auth::Authenticator;
use pulsenet_common::{NodeRef, PulseNumber, ShortNodeId};

use crate::error::ConsensusError;
use crate::member::{Power, PrimaryRole};

/// Part of a profile vouched for by an issuer. A profile carrying it is "full".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileExtension {
    pub startup_power: Power,
    pub issued_at_pulse: PulseNumber,
    pub issuer_id: ShortNodeId,
    pub issuer_signature: Vec<u8>,
}

/// Long-lived identity of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticProfile {
    pub node_id: ShortNodeId,
    pub node_ref: NodeRef,
    pub primary_role: PrimaryRole,
    pub public_key: Vec<u8>,
    pub address: String,
    pub extension: Option<ProfileExtension>,
}

#[derive(Serialize)]
struct ExtensionSigningView<'a> {
    node_id: ShortNodeId,
    node_ref: &'a NodeRef,
    primary_role: PrimaryRole,
    public_key: &'a [u8],
    startup_power: Power,
    issued_at_pulse: PulseNumber,
    issuer_id: ShortNodeId,
}

impl StaticProfile {
    /// Brief profile; the node ref is derived from the public key.
    pub fn new(node_id: ShortNodeId, primary_role: PrimaryRole, public_key: Vec<u8>, address: impl Into<String>) -> Self {
        Self {
            node_id,
            node_ref: NodeRef::from_public_key(&public_key),
            primary_role,
            public_key,
            address: address.into(),
            extension: None,
        }
    }

    pub fn with_extension(mut self, extension: ProfileExtension) -> Self {
        self.extension = Some(extension);
        self
    }

    pub fn is_full(&self) -> bool {
        self.extension.is_some()
    }

    pub fn brief(&self) -> StaticProfile {
        StaticProfile { extension: None, ..self.clone() }
    }

    /// Power the node starts with when it enters the census.
    pub fn startup_power(&self) -> Power {
        match &self.extension {
            Some(ext) => ext.startup_power,
            None if self.primary_role.is_working() => Power::DEFAULT,
            None => Power::ZERO,
        }
    }

    fn extension_signing_bytes(
        &self,
        startup_power: Power,
        issued_at_pulse: PulseNumber,
        issuer_id: ShortNodeId,
    ) -> Result<Vec<u8>, ConsensusError> {
        let view = ExtensionSigningView {
            node_id: self.node_id,
            node_ref: &self.node_ref,
            primary_role: self.primary_role,
            public_key: &self.public_key,
            startup_power,
            issued_at_pulse,
            issuer_id,
        };
        Ok(bincode::serialize(&view)?)
    }

    /// Issues an extension for this profile signed by `issuer`.
    pub fn issue_extension(
        &self,
        startup_power: Power,
        issued_at_pulse: PulseNumber,
        issuer_id: ShortNodeId,
        issuer: &dyn Authenticator,
    ) -> Result<ProfileExtension, ConsensusError> {
        let bytes = self.extension_signing_bytes(startup_power, issued_at_pulse, issuer_id)?;
        let issuer_signature = issuer.sign(&bytes)?;
        Ok(ProfileExtension {
            startup_power,
            issued_at_pulse,
            issuer_id,
            issuer_signature,
        })
    }

    /// Checks the extension signature against the issuer's key.
    pub fn verify_extension(&self, verifier: &dyn Authenticator, issuer_key: &[u8]) -> bool {
        let Some(ext) = &self.extension else {
            return false;
        };
        match self.extension_signing_bytes(ext.startup_power, ext.issued_at_pulse, ext.issuer_id) {
            Ok(bytes) => verifier
                .verify_with_key(&bytes, &ext.issuer_signature, issuer_key)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Compares the parts every profile carries, ignoring extensions.
pub fn equal_brief_profiles(a: &StaticProfile, b: &StaticProfile) -> bool {
    a.node_id == b.node_id
        && a.node_ref == b.node_ref
        && a.primary_role == b.primary_role
        && a.public_key == b.public_key
        && a.address == b.address
}

pub fn equal_extensions(a: Option<&ProfileExtension>, b: Option<&ProfileExtension>) -> bool {
    a == b
}
