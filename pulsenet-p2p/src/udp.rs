use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::P2pConfig;
use crate::message::NetworkError;
use crate::traits::{DatagramReceiver, Transport};

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_address: String,
    max_datagram_size: usize,
}

impl UdpTransport {
    pub async fn bind(config: &P2pConfig) -> Result<Self, NetworkError> {
        let socket = UdpSocket::bind(&config.listen_addr).await?;
        let local_address = socket.local_addr()?.to_string();
        info!("UDP transport listening on {}", local_address);
        Ok(Self {
            socket: Arc::new(socket),
            local_address,
            max_datagram_size: config.max_datagram_size,
        })
    }

    /// Reads datagrams until `shutdown` flips to true, handing each one to
    /// `receiver` on its own task.
    pub async fn run(&self, receiver: Arc<dyn DatagramReceiver>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; self.max_datagram_size];
        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((n, addr)) => {
                            debug!("udp datagram: size={} from={}", n, addr);
                            let payload = buf[..n].to_vec();
                            let receiver = Arc::clone(&receiver);
                            tokio::spawn(async move {
                                receiver.receive_datagram(addr.to_string(), payload).await;
                            });
                        }
                        Err(e) => warn!("udp receive failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("UDP transport on {} stopped", self.local_address);
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_datagram(&self, address: &str, payload: Vec<u8>) -> Result<(), NetworkError> {
        if payload.len() > self.max_datagram_size {
            return Err(NetworkError::DatagramTooLarge {
                size: payload.len(),
                max: self.max_datagram_size,
            });
        }
        self.socket.send_to(&payload, address).await?;
        Ok(())
    }

    fn local_address(&self) -> String {
        self.local_address.clone()
    }
}
