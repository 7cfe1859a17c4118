use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use pulsenet_common::auth::Authenticator;
use pulsenet_common::utils::time::current_time;
use pulsenet_common::{PulseNetError, PulseNumber, ShortNodeId};
use pulsenet_consensus::rules::{DiscoveryNode, MinRoles};
use pulsenet_consensus::{ConsensusConfig, Power, PrimaryRole, ProfileExtension, StaticCertificate, StaticProfile};
use pulsenet_p2p::P2pConfig;

fn default_session_ttl_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: ShortNodeId,
    #[serde(default = "default_role")]
    pub role: PrimaryRole,
    /// Address peers send datagrams to.
    pub address: String,
    pub listen_addr: String,
    pub data_dir: String,
    pub certificate: StaticCertificate,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    /// How long a joiner may sit in purgatory before its session expires.
    #[serde(default = "default_session_ttl_ms")]
    pub join_session_ttl_ms: u64,
    /// Issued by a member; lets this node join with a full profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_extension: Option<ProfileExtension>,
}

fn default_role() -> PrimaryRole {
    PrimaryRole::Virtual
}

impl Config {
    /// Config of a network made of this node alone.
    pub fn single_node(node_id: ShortNodeId, address: &str, public_key: Vec<u8>, data_dir: &str) -> Self {
        Self {
            node_id,
            role: PrimaryRole::Virtual,
            address: address.to_string(),
            listen_addr: address.to_string(),
            data_dir: data_dir.to_string(),
            certificate: StaticCertificate {
                discovery_nodes: vec![DiscoveryNode {
                    node_id,
                    role: PrimaryRole::Virtual,
                    address: address.to_string(),
                    public_key,
                }],
                majority_rule: 1,
                min_roles: MinRoles {
                    virtual_nodes: 1,
                    ..MinRoles::default()
                },
            },
            consensus: ConsensusConfig {
                ephemeral: true,
                ..ConsensusConfig::default()
            },
            join_session_ttl_ms: default_session_ttl_ms(),
            profile_extension: None,
        }
    }

    /// Profile this node announces, full when the config carries an extension.
    pub fn local_profile(&self, public_key: Vec<u8>) -> StaticProfile {
        let profile = StaticProfile::new(self.node_id, self.role, public_key, self.address.clone());
        match &self.profile_extension {
            Some(extension) => profile.with_extension(extension.clone()),
            None => profile,
        }
    }

    /// Signs an extension for the node `joiner` describes and stores it in
    /// that config. `self` is the config of the issuing member.
    pub fn issue_extension_for(
        &self,
        issuer: &dyn Authenticator,
        joiner: &mut Config,
        joiner_key: Vec<u8>,
        startup_power: Power,
    ) -> Result<(), PulseNetError> {
        if joiner.node_id == self.node_id {
            return Err(PulseNetError::Config("a node cannot issue its own extension".into()));
        }
        let issued_at = PulseNumber::of_unix_time(current_time()).map_err(|e| PulseNetError::Other(e.to_string()))?;
        let brief = StaticProfile::new(joiner.node_id, joiner.role, joiner_key, joiner.address.clone());
        let extension = brief
            .issue_extension(startup_power, issued_at, self.node_id, issuer)
            .map_err(|e| PulseNetError::Auth(e.to_string()))?;
        joiner.profile_extension = Some(extension);
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        let parsed =
            serde_json::from_str::<Config>(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(parsed)
    }

    pub fn p2p_config(&self) -> P2pConfig {
        P2pConfig {
            listen_addr: self.listen_addr.clone(),
            max_datagram_size: self.consensus.max_packet_size,
        }
    }

    pub fn storage_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("pulses.jsonl")
    }

    pub fn validate(&self) -> Result<(), PulseNetError> {
        if self.node_id.is_absent() {
            return Err(PulseNetError::Config("node_id must not be 0".into()));
        }
        if !self.role.is_working() {
            return Err(PulseNetError::Config(format!("role {:?} cannot run rounds", self.role)));
        }
        if self.address.is_empty() || self.listen_addr.is_empty() {
            return Err(PulseNetError::Config("address and listen_addr are required".into()));
        }
        let discovery = &self.certificate.discovery_nodes;
        if discovery.is_empty() {
            return Err(PulseNetError::Config("certificate lists no discovery nodes".into()));
        }
        if self.certificate.majority_rule == 0 || self.certificate.majority_rule > discovery.len() {
            return Err(PulseNetError::Config(format!(
                "majority_rule {} must be within 1..={}",
                self.certificate.majority_rule,
                discovery.len()
            )));
        }
        let mut ids: Vec<ShortNodeId> = discovery.iter().map(|d| d.node_id).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != discovery.len() {
            return Err(PulseNetError::Config("duplicate discovery node id".into()));
        }
        if let Some(extension) = &self.profile_extension {
            if extension.issuer_id == self.node_id {
                return Err(PulseNetError::Config("profile extension is self-issued".into()));
            }
        }
        self.consensus.validate().map_err(PulseNetError::Config)?;
        Ok(())
    }
}
