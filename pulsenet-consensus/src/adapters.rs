//! Entry points from the transport into consensus.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use pulsenet_common::PulseData;
use pulsenet_p2p::DatagramReceiver;

use crate::error::ConsensusError;
use crate::packet::InboundPacket;

/// Address a packet came from. Pulses carry the synthetic `pulsar` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Inbound {
    pub addr: String,
}

impl Inbound {
    pub const PULSAR: &'static str = "pulsar";

    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn pulsar() -> Self {
        Self::new(Self::PULSAR)
    }

    pub fn is_pulsar(&self) -> bool {
        self.addr == Self::PULSAR
    }
}

impl fmt::Display for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

#[async_trait]
pub trait PacketProcessor: Send + Sync {
    async fn process_packet(&self, packet: InboundPacket, from: Inbound) -> Result<(), ConsensusError>;
}

pub trait PacketParserFactory: Send + Sync {
    fn parse_packet(&self, buf: &[u8]) -> Result<InboundPacket, ConsensusError>;
}

/// Parses datagrams and hands them to the processor. Failures are logged
/// and the datagram dropped.
#[derive(Default, Clone)]
pub struct DatagramHandler {
    packet_processor: Option<Arc<dyn PacketProcessor>>,
    packet_parser_factory: Option<Arc<dyn PacketParserFactory>>,
}

impl DatagramHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_packet_processor(&mut self, processor: Arc<dyn PacketProcessor>) {
        self.packet_processor = Some(processor);
    }

    pub fn set_packet_parser_factory(&mut self, factory: Arc<dyn PacketParserFactory>) {
        self.packet_parser_factory = Some(factory);
    }

    pub async fn handle_datagram(&self, address: &str, buf: &[u8]) {
        let (Some(processor), Some(factory)) = (&self.packet_processor, &self.packet_parser_factory) else {
            error!("Datagram handler is not initialized, dropping datagram from {}", address);
            return;
        };

        let packet = match factory.parse_packet(buf) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to parse datagram from {}: {}", address, e);
                return;
            }
        };

        let packet_type = packet.packet_type();
        let source = packet.source_id();
        if let Err(e) = processor.process_packet(packet, Inbound::new(address)).await {
            if e.is_packet_error() {
                debug!("Dropped {} packet from node {} at {}: {}", packet_type, source, address, e);
            } else {
                error!("Failed to process {} packet from {}: {}", packet_type, address, e);
            }
        }
    }
}

#[async_trait]
impl DatagramReceiver for DatagramHandler {
    async fn receive_datagram(&self, from: String, payload: Vec<u8>) {
        self.handle_datagram(&from, &payload).await;
    }
}

/// Feeds pulses from the pulsar into the processor.
#[derive(Default, Clone)]
pub struct PulseHandler {
    packet_processor: Option<Arc<dyn PacketProcessor>>,
}

impl PulseHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_packet_processor(&mut self, processor: Arc<dyn PacketProcessor>) {
        self.packet_processor = Some(processor);
    }

    pub async fn handle_pulse(&self, pulse: PulseData, raw: Vec<u8>) {
        let Some(processor) = &self.packet_processor else {
            error!("Pulse handler is not initialized, dropping pulse {}", pulse);
            return;
        };
        if let Err(e) = processor
            .process_packet(InboundPacket::Pulse { pulse, raw }, Inbound::pulsar())
            .await
        {
            error!("Failed to process pulse {}: {}", pulse, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MemberPacket, PacketBody, PacketCodec, SyncRequest};
    use pulsenet_common::{PulseNumber, ShortNodeId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector {
        seen: Mutex<Vec<(String, InboundPacket)>>,
    }

    #[async_trait]
    impl PacketProcessor for Collector {
        async fn process_packet(&self, packet: InboundPacket, from: Inbound) -> Result<(), ConsensusError> {
            self.seen.lock().unwrap().push((from.addr, packet));
            Ok(())
        }
    }

    fn handler(collector: &Arc<Collector>) -> DatagramHandler {
        let mut handler = DatagramHandler::new();
        handler.set_packet_processor(Arc::clone(collector) as Arc<dyn PacketProcessor>);
        handler.set_packet_parser_factory(Arc::new(PacketCodec::new(1400)));
        handler
    }

    #[tokio::test]
    async fn test_datagram_routed_to_processor() {
        let collector = Arc::new(Collector::default());
        let handler = handler(&collector);
        let packet = MemberPacket::new(
            PulseNumber::MIN_TIME,
            ShortNodeId(4),
            ShortNodeId(1),
            PacketBody::SyncRequest(SyncRequest { request_id: 3 }),
        );
        let buf = PacketCodec::new(1400).encode(&packet).unwrap();
        handler.receive_datagram("10.0.0.4:4000".into(), buf).await;

        let seen = collector.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "10.0.0.4:4000");
        assert!(matches!(&seen[0].1, InboundPacket::Member(p) if *p == packet));
    }

    #[tokio::test]
    async fn test_bad_datagram_dropped() {
        let collector = Arc::new(Collector::default());
        handler(&collector).handle_datagram("x", &[0xFF, 0x00]).await;
        DatagramHandler::new().handle_datagram("x", &[1, 2, 3]).await;
        assert!(collector.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pulse_comes_from_pulsar() {
        let collector = Arc::new(Collector::default());
        let mut pulses = PulseHandler::new();
        pulses.set_packet_processor(Arc::clone(&collector) as Arc<dyn PacketProcessor>);
        let pulse = PulseData::new_first_ephemeral();
        pulses.handle_pulse(pulse, vec![]).await;

        let seen = collector.seen.lock().unwrap();
        assert_eq!(seen[0].0, Inbound::PULSAR);
        assert!(matches!(seen[0].1, InboundPacket::Pulse { pulse: p, .. } if p == pulse));
    }
}
