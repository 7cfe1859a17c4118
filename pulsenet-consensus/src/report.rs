use std::sync::Arc;

use serde::{Deserialize, Serialize};

use pulsenet_common::PulseNumber;

use crate::member::{OpMode, Power};

/// Outcome of one round as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub pulse_number: PulseNumber,
    pub member_power: Power,
    pub member_mode: OpMode,
    pub is_joiner: bool,
    pub population_valid: bool,
}

pub type OnConsensusFinished = Arc<dyn Fn(Report) + Send + Sync>;
