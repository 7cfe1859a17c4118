use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to send datagram to {0}")]
    SendError(String),
    #[error("Peer {0} not found")]
    PeerNotFound(String),
    #[error("Datagram of {size} bytes exceeds the limit of {max} bytes")]
    DatagramTooLarge { size: usize, max: usize },
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
