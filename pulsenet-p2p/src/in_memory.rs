use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::debug;

use crate::message::NetworkError;
use crate::traits::{DatagramReceiver, Transport};

type Datagram = (String, Vec<u8>);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared switchboard connecting in-process transports by address.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    peers: Arc<Mutex<HashMap<String, Sender<Datagram>>>>,
    offline: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` and returns the transport bound to it.
    pub fn connect(&self, address: &str) -> InMemoryTransport {
        let (tx, rx) = mpsc::channel(1024);
        lock(&self.peers).insert(address.to_string(), tx);
        InMemoryTransport {
            address: address.to_string(),
            hub: self.clone(),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// An offline address neither sends nor receives; datagrams are dropped silently.
    pub fn set_offline(&self, address: &str, offline: bool) {
        let mut set = lock(&self.offline);
        if offline {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    fn is_offline(&self, address: &str) -> bool {
        lock(&self.offline).contains(address)
    }

    fn sender(&self, address: &str) -> Option<Sender<Datagram>> {
        lock(&self.peers).get(address).cloned()
    }
}

pub struct InMemoryTransport {
    address: String,
    hub: InMemoryHub,
    rx: Mutex<Option<Receiver<Datagram>>>,
}

impl InMemoryTransport {
    /// Delivers inbound datagrams to `receiver`, one task per datagram.
    /// Returns when the hub side of the channel closes or when called twice.
    pub async fn run(&self, receiver: Arc<dyn DatagramReceiver>) {
        let rx = lock(&self.rx).take();
        let Some(mut rx) = rx else {
            return;
        };
        while let Some((from, payload)) = rx.recv().await {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                receiver.receive_datagram(from, payload).await;
            });
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send_datagram(&self, address: &str, payload: Vec<u8>) -> Result<(), NetworkError> {
        if self.hub.is_offline(&self.address) || self.hub.is_offline(address) {
            debug!("dropping datagram {} -> {} (offline)", self.address, address);
            return Ok(());
        }
        let sender = self
            .hub
            .sender(address)
            .ok_or_else(|| NetworkError::PeerNotFound(address.to_string()))?;
        sender
            .send((self.address.clone(), payload))
            .await
            .map_err(|_| NetworkError::SendError(address.to_string()))
    }

    fn local_address(&self) -> String {
        self.address.clone()
    }
}
