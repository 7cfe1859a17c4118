//! Pulse log kept as one JSON object per line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use pulsenet_common::{PulseData, PulseNetError, PulseNumber};
use pulsenet_consensus::PulseStorage;

pub struct FilePulseStorage {
    path: PathBuf,
    pulses: Mutex<BTreeMap<PulseNumber, PulseData>>,
}

impl FilePulseStorage {
    /// Opens the log at `path`, creating it when missing. Lines that do not
    /// parse are skipped.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PulseNetError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut pulses = BTreeMap::new();
        match fs::read_to_string(&path).await {
            Ok(data) => {
                for (line_no, line) in data.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                    match serde_json::from_str::<PulseData>(line) {
                        Ok(pulse) => {
                            pulses.insert(pulse.number, pulse);
                        }
                        Err(e) => warn!("Skipping line {} of {}: {}", line_no + 1, path.display(), e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("Loaded {} pulses from {}", pulses.len(), path.display());

        Ok(Self {
            path,
            pulses: Mutex::new(pulses),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.pulses.lock().await.len()
    }
}

#[async_trait]
impl PulseStorage for FilePulseStorage {
    async fn append(&self, pulse: PulseData) -> Result<(), PulseNetError> {
        let mut pulses = self.pulses.lock().await;
        if let Some((last, _)) = pulses.last_key_value() {
            if *last >= pulse.number {
                return Err(PulseNetError::Storage(format!(
                    "pulse {} does not follow stored pulse {}",
                    pulse.number, last
                )));
            }
        }

        let mut line = serde_json::to_string(&pulse)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        pulses.insert(pulse.number, pulse);
        Ok(())
    }

    async fn latest(&self) -> Result<Option<PulseData>, PulseNetError> {
        Ok(self.pulses.lock().await.values().next_back().copied())
    }

    async fn get(&self, number: PulseNumber) -> Result<Option<PulseData>, PulseNetError> {
        Ok(self.pulses.lock().await.get(&number).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(len: usize) -> Vec<PulseData> {
        let mut pulses = vec![PulseData::new_first_ephemeral()];
        while pulses.len() < len {
            let next = pulses[pulses.len() - 1].create_next_ephemeral_pulse().unwrap();
            pulses.push(next);
        }
        pulses
    }

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("pulses.jsonl");
        let pulses = chain(3);

        let storage = FilePulseStorage::open(&path).await.unwrap();
        for pulse in &pulses {
            storage.append(*pulse).await.unwrap();
        }
        assert_eq!(storage.latest().await.unwrap(), Some(pulses[2]));

        let reopened = FilePulseStorage::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 3);
        assert_eq!(reopened.get(pulses[1].number).await.unwrap(), Some(pulses[1]));
        assert_eq!(reopened.previous(pulses[2].number).await.unwrap(), Some(pulses[1]));
    }

    #[tokio::test]
    async fn test_rejects_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilePulseStorage::open(dir.path().join("pulses.jsonl")).await.unwrap();
        let pulses = chain(2);

        storage.append(pulses[1]).await.unwrap();
        let err = storage.append(pulses[0]).await.unwrap_err();
        assert!(matches!(err, PulseNetError::Storage(_)));
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulses.jsonl");
        let pulse = PulseData::new_first_ephemeral();
        let content = format!("{}\n{{broken\n", serde_json::to_string(&pulse).unwrap());
        std::fs::write(&path, content).unwrap();

        let storage = FilePulseStorage::open(&path).await.unwrap();
        assert_eq!(storage.latest().await.unwrap(), Some(pulse));
    }
}
