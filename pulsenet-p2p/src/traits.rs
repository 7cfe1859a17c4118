use async_trait::async_trait;

use crate::message::NetworkError;

/// Unreliable datagram delivery. Loss, duplication and reordering are all
/// possible; callers must cope with each of them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one datagram to the peer listening on `address`.
    async fn send_datagram(&self, address: &str, payload: Vec<u8>) -> Result<(), NetworkError>;

    /// Address other peers use to reach this transport.
    fn local_address(&self) -> String;
}

/// Consumer of inbound datagrams. Each datagram is delivered on its own task.
#[async_trait]
pub trait DatagramReceiver: Send + Sync {
    async fn receive_datagram(&self, from: String, payload: Vec<u8>);
}
