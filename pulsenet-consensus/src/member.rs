use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared primary role of a node. The order is the census sort priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryRole {
    Virtual,
    HeavyMaterial,
    LightMaterial,
    Neutral,
    #[default]
    Inactive,
}

impl PrimaryRole {
    pub const ALL: [PrimaryRole; 5] = [
        PrimaryRole::Virtual,
        PrimaryRole::HeavyMaterial,
        PrimaryRole::LightMaterial,
        PrimaryRole::Neutral,
        PrimaryRole::Inactive,
    ];

    pub fn is_working(self) -> bool {
        self != PrimaryRole::Inactive
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PrimaryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimaryRole::Virtual => "virtual",
            PrimaryRole::HeavyMaterial => "heavy-material",
            PrimaryRole::LightMaterial => "light-material",
            PrimaryRole::Neutral => "neutral",
            PrimaryRole::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// Voting power a member contributes in a pulse. Zero means idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Power(pub u8);

impl Power {
    pub const ZERO: Power = Power(0);
    pub const DEFAULT: Power = Power(1);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpMode {
    #[default]
    Normal,
    /// Announcements from this member are accepted only through neighbours.
    RestrictedAnnouncement,
    Suspended,
    EvictedGracefully,
    EvictedAsFraud,
    EvictedAsSuspected,
}

impl OpMode {
    pub fn is_evicted(self) -> bool {
        matches!(
            self,
            OpMode::EvictedGracefully | OpMode::EvictedAsFraud | OpMode::EvictedAsSuspected
        )
    }

    pub fn is_suspended(self) -> bool {
        self == OpMode::Suspended
    }

    pub fn is_mistrustful(self) -> bool {
        self == OpMode::RestrictedAnnouncement
    }

    /// Whether a member in this mode contributes its power.
    pub fn can_vote(self) -> bool {
        matches!(self, OpMode::Normal | OpMode::RestrictedAnnouncement)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Position of a node in the round: its role, power and index within the
/// indexed population. A zero `count` marks a joiner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rank {
    pub role: PrimaryRole,
    pub power: Power,
    pub index: u16,
    pub count: u16,
}

impl Rank {
    pub fn new(role: PrimaryRole, power: Power, index: u16, count: u16) -> Self {
        Self { role, power, index, count }
    }

    pub fn joiner() -> Self {
        Self::default()
    }

    pub fn is_joiner(&self) -> bool {
        self.count == 0
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_joiner() {
            return f.write_str("joiner");
        }
        write!(f, "{}:{}/{}:{}", self.role, self.index, self.count, self.power)
    }
}
