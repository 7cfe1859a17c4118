use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use pulsenet_common::{PulseData, PulseNetError, PulseNumber};

/// Append-only record of finalized pulses.
#[async_trait]
pub trait PulseStorage: Send + Sync {
    /// Appends a pulse. Numbers must increase.
    async fn append(&self, pulse: PulseData) -> Result<(), PulseNetError>;

    async fn latest(&self) -> Result<Option<PulseData>, PulseNetError>;

    async fn get(&self, number: PulseNumber) -> Result<Option<PulseData>, PulseNetError>;

    /// Pulse preceding `number`, found through its `prev_delta`.
    async fn previous(&self, number: PulseNumber) -> Result<Option<PulseData>, PulseNetError> {
        let Some(pulse) = self.get(number).await? else {
            return Ok(None);
        };
        match pulse.prev_pulse_number() {
            Ok(prev) => self.get(prev).await,
            Err(_) => Ok(None),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPulseStorage {
    pulses: RwLock<BTreeMap<PulseNumber, PulseData>>,
}

impl InMemoryPulseStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PulseStorage for InMemoryPulseStorage {
    async fn append(&self, pulse: PulseData) -> Result<(), PulseNetError> {
        let mut pulses = self.pulses.write().await;
        if let Some((last, _)) = pulses.last_key_value() {
            if *last >= pulse.number {
                return Err(PulseNetError::Storage(format!(
                    "pulse {} does not follow stored pulse {}",
                    pulse.number, last
                )));
            }
        }
        pulses.insert(pulse.number, pulse);
        Ok(())
    }

    async fn latest(&self) -> Result<Option<PulseData>, PulseNetError> {
        Ok(self.pulses.read().await.values().next_back().copied())
    }

    async fn get(&self, number: PulseNumber) -> Result<Option<PulseData>, PulseNetError> {
        Ok(self.pulses.read().await.get(&number).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read() {
        let storage = InMemoryPulseStorage::new();
        assert!(storage.latest().await.unwrap().is_none());

        let first = PulseData::new_first_ephemeral();
        let second = first.create_next_ephemeral_pulse().unwrap();
        storage.append(first).await.unwrap();
        storage.append(second).await.unwrap();

        assert_eq!(storage.latest().await.unwrap(), Some(second));
        assert_eq!(storage.get(first.number).await.unwrap(), Some(first));
        assert_eq!(storage.previous(second.number).await.unwrap(), Some(first));
        assert_eq!(storage.previous(first.number).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_must_increase() {
        let storage = InMemoryPulseStorage::new();
        let first = PulseData::new_first_ephemeral();
        storage.append(first).await.unwrap();
        assert!(matches!(storage.append(first).await, Err(PulseNetError::Storage(_))));
    }
}
