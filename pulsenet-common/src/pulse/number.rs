use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PulseError;

/// Numbers below this value are reserved for special purposes.
pub const LOCAL_RELATIVE: u32 = 65536;
/// The first pulse number that denotes a point in time.
pub const MIN_TIME_PULSE: u32 = LOCAL_RELATIVE + 1;
pub const MAX_TIME_PULSE: u32 = (1 << 30) - 1;
/// Unix time (seconds) that corresponds to `MIN_TIME_PULSE`.
pub const UNIX_TIME_OF_MIN_TIME_PULSE: u64 = 1_546_300_800;

/// A pulse number. Zero is unknown, `1..=65536` are special numbers and
/// `MIN_TIME_PULSE..=MAX_TIME_PULSE` are time pulses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PulseNumber(u32);

impl PulseNumber {
    pub const UNKNOWN: PulseNumber = PulseNumber(0);
    pub const MIN_TIME: PulseNumber = PulseNumber(MIN_TIME_PULSE);

    pub const fn new(value: u32) -> Self {
        PulseNumber(value)
    }

    /// Maps a unix timestamp onto the time pulse scale (one pulse number per second).
    pub fn of_unix_time(secs: u64) -> Result<Self, PulseError> {
        let offset = secs.saturating_sub(UNIX_TIME_OF_MIN_TIME_PULSE);
        let value = u64::from(MIN_TIME_PULSE) + offset;
        if value > u64::from(MAX_TIME_PULSE) {
            return Err(PulseError::OutOfRange(u32::try_from(value).unwrap_or(u32::MAX)));
        }
        Ok(PulseNumber(value as u32))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    pub const fn is_time_pulse(self) -> bool {
        self.0 >= MIN_TIME_PULSE && self.0 <= MAX_TIME_PULSE
    }

    pub const fn is_special(self) -> bool {
        self.0 > 0 && self.0 < MIN_TIME_PULSE
    }

    pub const fn is_special_or_time_pulse(self) -> bool {
        self.0 > 0 && self.0 <= MAX_TIME_PULSE
    }

    /// Returns the time pulse `delta` steps ahead of this one.
    pub fn next(self, delta: u16) -> Result<Self, PulseError> {
        if !self.is_time_pulse() {
            return Err(PulseError::OutOfRange(self.0));
        }
        let value = self.0 + u32::from(delta);
        if value > MAX_TIME_PULSE {
            return Err(PulseError::OutOfRange(value));
        }
        Ok(PulseNumber(value))
    }

    /// Returns the time pulse `delta` steps behind this one.
    pub fn prev(self, delta: u16) -> Result<Self, PulseError> {
        if !self.is_time_pulse() {
            return Err(PulseError::OutOfRange(self.0));
        }
        match self.0.checked_sub(u32::from(delta)) {
            Some(value) if value >= MIN_TIME_PULSE => Ok(PulseNumber(value)),
            _ => Err(PulseError::OutOfRange(self.0)),
        }
    }
}

impl From<u32> for PulseNumber {
    fn from(value: u32) -> Self {
        PulseNumber(value)
    }
}

impl fmt::Display for PulseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
