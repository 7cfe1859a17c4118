use crate::packet::PacketType;

const UNLIMITED: u8 = u8::MAX;

/// Per-peer packet budget for one round. Counts received and sent packets of
/// each type separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLimiter {
    budget: [u8; PacketType::COUNT],
    received: [u8; PacketType::COUNT],
    sent: [u8; PacketType::COUNT],
}

impl PacketLimiter {
    pub fn new(is_joiner: bool) -> Self {
        let mut budget = [0u8; PacketType::COUNT];
        budget[PacketType::Pulsar.index()] = 1;
        budget[PacketType::Announcement.index()] = 2;
        budget[PacketType::Vector.index()] = if is_joiner { 1 } else { 2 };
        budget[PacketType::Entropy.index()] = 1;
        budget[PacketType::Finalize.index()] = 1;
        budget[PacketType::SyncRequest.index()] = UNLIMITED;
        budget[PacketType::SyncReply.index()] = UNLIMITED;
        Self {
            budget,
            received: [0; PacketType::COUNT],
            sent: [0; PacketType::COUNT],
        }
    }

    fn has_room(&self, counts: &[u8; PacketType::COUNT], packet_type: PacketType) -> bool {
        let i = packet_type.index();
        self.budget[i] == UNLIMITED || counts[i] < self.budget[i]
    }

    pub fn can_receive_packet(&self, packet_type: PacketType) -> bool {
        self.has_room(&self.received, packet_type)
    }

    /// Counts a received packet. Returns `false`, counting nothing, when the
    /// budget for its type is spent.
    pub fn set_packet_received(&mut self, packet_type: PacketType) -> bool {
        if !self.can_receive_packet(packet_type) {
            return false;
        }
        let i = packet_type.index();
        self.received[i] = self.received[i].saturating_add(1);
        true
    }

    pub fn can_send_packet(&self, packet_type: PacketType) -> bool {
        self.has_room(&self.sent, packet_type)
    }

    pub fn set_packet_sent(&mut self, packet_type: PacketType) -> bool {
        if !self.can_send_packet(packet_type) {
            return false;
        }
        let i = packet_type.index();
        self.sent[i] = self.sent[i].saturating_add(1);
        true
    }

    /// Packets that can still be received across all limited types.
    pub fn remaining_packet_count_default(&self) -> usize {
        self.budget
            .iter()
            .zip(self.received.iter())
            .filter(|(budget, _)| **budget != UNLIMITED)
            .map(|(budget, received)| usize::from(budget.saturating_sub(*received)))
            .sum()
    }
}
