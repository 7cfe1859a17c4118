use std::collections::VecDeque;

use crate::adapters::Inbound;
use crate::packet::MemberPacket;

#[derive(Debug, Clone)]
pub struct RecordedPacket {
    pub packet: MemberPacket,
    pub from: Inbound,
}

/// Bounded buffer of packets that arrived before their sender was known.
/// Keeps receipt order; once full, further packets are refused.
#[derive(Debug)]
pub struct PacketRecorder {
    packets: VecDeque<RecordedPacket>,
    capacity: usize,
}

impl PacketRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` when the recorder is full and the packet was dropped.
    pub fn record(&mut self, packet: MemberPacket, from: Inbound) -> bool {
        if self.packets.len() >= self.capacity {
            return false;
        }
        self.packets.push_back(RecordedPacket { packet, from });
        true
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Takes every recorded packet in receipt order.
    pub fn drain(&mut self) -> Vec<RecordedPacket> {
        self.packets.drain(..).collect()
    }
}
