use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::phases::RoundPhase;
use crate::purgatory::AscensionPolicy;

/// Round timing and admission settings. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub announce_timeout_ms: u64,
    pub vector_timeout_ms: u64,
    pub entropy_timeout_ms: u64,
    pub finalize_timeout_ms: u64,
    /// Run ephemeral pulses locally instead of waiting for a pulsar.
    pub ephemeral: bool,
    pub pulse_interval_ms: u64,
    /// How many ephemeral pulses a peer announcement may move us ahead.
    pub max_pulse_catch_up: u32,
    pub ascension: AscensionPolicy,
    pub max_joiners_per_pulse: usize,
    /// Packets for future pulses kept until their round opens.
    pub early_packet_buffer: usize,
    pub sync_timeout_ms: u64,
    pub sync_attempts: usize,
    pub keeper_history: usize,
    pub max_packet_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            announce_timeout_ms: 500,
            vector_timeout_ms: 500,
            entropy_timeout_ms: 500,
            finalize_timeout_ms: 500,
            ephemeral: false,
            pulse_interval_ms: 3000,
            max_pulse_catch_up: 256,
            ascension: AscensionPolicy::default(),
            max_joiners_per_pulse: 4,
            early_packet_buffer: 256,
            sync_timeout_ms: 1000,
            sync_attempts: 3,
            keeper_history: 16,
            max_packet_size: pulsenet_p2p::config::DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

impl ConsensusConfig {
    pub fn phase_timeout(&self, phase: RoundPhase) -> Duration {
        let ms = match phase {
            RoundPhase::Announcing => self.announce_timeout_ms,
            RoundPhase::VectorExchange => self.vector_timeout_ms,
            RoundPhase::EntropyExchange => self.entropy_timeout_ms,
            RoundPhase::Finalizing => self.finalize_timeout_ms,
            RoundPhase::Idle | RoundPhase::Sealed => 0,
        };
        Duration::from_millis(ms)
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ephemeral && self.pulse_interval_ms == 0 {
            return Err("pulse_interval_ms must be positive in ephemeral mode".into());
        }
        let round = self.announce_timeout_ms + self.vector_timeout_ms + self.entropy_timeout_ms + self.finalize_timeout_ms;
        if self.ephemeral && round >= self.pulse_interval_ms {
            return Err(format!(
                "phase timeouts ({round} ms) must fit in the pulse interval ({} ms)",
                self.pulse_interval_ms
            ));
        }
        if self.max_packet_size < 512 {
            return Err("max_packet_size must be at least 512 bytes".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConsensusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.phase_timeout(RoundPhase::Announcing), Duration::from_millis(500));
        assert_eq!(config.phase_timeout(RoundPhase::Sealed), Duration::ZERO);
    }

    #[test]
    fn test_round_must_fit_interval() {
        let config = ConsensusConfig {
            ephemeral: true,
            pulse_interval_ms: 1000,
            ..ConsensusConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ConsensusConfig = serde_json::from_str(r#"{"ephemeral": true}"#).unwrap();
        assert!(config.ephemeral);
        assert_eq!(config.sync_attempts, 3);
    }
}
