use thiserror::Error;

#[derive(Debug, Error)]
pub enum PulseNetError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Consensus error: {0}")]
    Consensus(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other: {0}")]
    Other(String),
}

impl From<bincode::Error> for PulseNetError {
    fn from(e: bincode::Error) -> Self {
        PulseNetError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for PulseNetError {
    fn from(e: serde_json::Error) -> Self {
        PulseNetError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PulseNetError>;

/// Violations of pulse arithmetic and lineage rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PulseError {
    #[error("delta can't be zero")]
    ZeroDelta,

    #[error("pulse number {0} is out of the time pulse range")]
    OutOfRange(u32),

    #[error("pulse {0} is an expected pulse and has no successor yet")]
    ExpectedPulse(u32),

    #[error("pulse {0} is the first pulse of its chain")]
    FirstPulse(u32),

    #[error("pulse {0} is not from an ephemeral lineage")]
    NotEphemeral(u32),

    #[error("pulse {0} is from an ephemeral lineage")]
    Ephemeral(u32),
}
