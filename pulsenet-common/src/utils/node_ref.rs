use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PulseNetError;
use crate::pulse::Bits256;

/// Long-lived reference of a node, stable across pulses.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef(pub [u8; 32]);

impl NodeRef {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        NodeRef(bytes)
    }

    /// Reference derived from a node's public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        NodeRef(crate::crypto::hash::digest_bytes(public_key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to the given entropy. Used to order competing join claims.
    pub fn xor_entropy(&self, entropy: &Bits256) -> [u8; 32] {
        (Bits256(self.0) ^ *entropy).0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({})", self)
    }
}

impl FromStr for NodeRef {
    type Err = PulseNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| PulseNetError::Other(format!("invalid node ref {s}: {e}")))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PulseNetError::Other(format!("invalid node ref length: {s}")))?;
        Ok(NodeRef(array))
    }
}

/// Compact per-pulse alias of a node. Zero means absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortNodeId(pub u32);

impl ShortNodeId {
    pub const ABSENT: ShortNodeId = ShortNodeId(0);

    pub fn is_absent(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for ShortNodeId {
    fn from(v: u32) -> Self {
        ShortNodeId(v)
    }
}

impl fmt::Display for ShortNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
