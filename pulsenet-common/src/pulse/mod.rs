//! Pulse numbers, pulse data and the entropy carried by pulses.

pub mod data;
pub mod entropy;
pub mod number;

pub use data::{PulseData, EPHEMERAL_PULSE_EPOCH, INVALID_PULSE_EPOCH};
pub use entropy::{fill_with_static_noise, Bits256};
pub use number::{PulseNumber, MAX_TIME_PULSE, MIN_TIME_PULSE};
