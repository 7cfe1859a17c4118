use serde::{Deserialize, Serialize};

/// Upper bound for one datagram. Large enough for a census sync reply of a
/// few dozen members.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 8192;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    pub listen_addr: String,
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

fn default_max_datagram_size() -> usize {
    DEFAULT_MAX_DATAGRAM_SIZE
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}
