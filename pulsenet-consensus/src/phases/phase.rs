use std::fmt;

use crate::packet::PacketType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoundPhase {
    Idle,
    Announcing,
    VectorExchange,
    EntropyExchange,
    Finalizing,
    Sealed,
}

impl RoundPhase {
    /// Phases that exchange packets, in order.
    pub const ACTIVE: [RoundPhase; 4] = [
        RoundPhase::Announcing,
        RoundPhase::VectorExchange,
        RoundPhase::EntropyExchange,
        RoundPhase::Finalizing,
    ];

    pub fn next(self) -> RoundPhase {
        match self {
            RoundPhase::Idle => RoundPhase::Announcing,
            RoundPhase::Announcing => RoundPhase::VectorExchange,
            RoundPhase::VectorExchange => RoundPhase::EntropyExchange,
            RoundPhase::EntropyExchange => RoundPhase::Finalizing,
            RoundPhase::Finalizing | RoundPhase::Sealed => RoundPhase::Sealed,
        }
    }

    pub fn packet_type(self) -> Option<PacketType> {
        match self {
            RoundPhase::Announcing => Some(PacketType::Announcement),
            RoundPhase::VectorExchange => Some(PacketType::Vector),
            RoundPhase::EntropyExchange => Some(PacketType::Entropy),
            RoundPhase::Finalizing => Some(PacketType::Finalize),
            RoundPhase::Idle | RoundPhase::Sealed => None,
        }
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
