use std::fs;
use std::path::Path;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::info;

use pulsenet_common::auth::ed25519::Ed25519Authenticator;
use pulsenet_common::{PulseNetError, Result};

/// Loads the node key stored as a hex seed, or generates and stores a new one.
pub fn load_or_generate_keypair(path: &Path) -> Result<Ed25519Authenticator> {
    if path.exists() {
        let data = fs::read_to_string(path)?;
        let seed = hex::decode(data.trim()).map_err(|e| PulseNetError::Auth(format!("{}: {}", path.display(), e)))?;
        return Ed25519Authenticator::from_bytes(&seed);
    }

    let mut csprng = OsRng;
    let auth = Ed25519Authenticator::new(SigningKey::generate(&mut csprng));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, hex::encode(auth.to_bytes()))?;
    info!("Generated new node key at {}", path.display());
    Ok(auth)
}
