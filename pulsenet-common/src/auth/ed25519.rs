use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use super::Authenticator;
use crate::error::{PulseNetError, Result};

pub struct Ed25519Authenticator {
    keypair: SigningKey,
}

impl Ed25519Authenticator {
    pub fn new(keypair: SigningKey) -> Self {
        Self { keypair }
    }

    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self::new(SigningKey::generate(&mut csprng))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: &[u8; 32] = bytes
            .try_into()
            .map_err(|_| PulseNetError::Auth("Invalid key length".to_string()))?;
        Ok(Self { keypair: SigningKey::from_bytes(seed) })
    }

    /// Secret seed, for persisting the key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.keypair.to_bytes()
    }
}

fn parse_signature(signature: &[u8]) -> Result<Signature> {
    Signature::from_slice(signature).map_err(|e| PulseNetError::Auth(e.to_string()))
}

impl Authenticator for Ed25519Authenticator {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.keypair.sign(message).to_vec())
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool> {
        let signature = parse_signature(signature)?;
        Ok(self.keypair.verifying_key().verify(message, &signature).is_ok())
    }

    fn verify_with_key(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
        let key: &[u8; 32] = public_key
            .try_into()
            .map_err(|_| PulseNetError::Auth("Invalid public key length".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(key).map_err(|e| PulseNetError::Auth(e.to_string()))?;
        let signature = parse_signature(signature)?;
        Ok(verifying_key.verify(message, &signature).is_ok())
    }

    fn public_key(&self) -> Vec<u8> {
        self.keypair.verifying_key().to_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_signing_and_verification() {
        let mut csprng = OsRng;
        let keypair = SigningKey::generate(&mut csprng);
        let auth = Ed25519Authenticator::new(keypair);

        let message = b"hello world";
        let signature = auth.sign(message).expect("Signing failed");
        assert_eq!(signature.len(), 64);

        assert!(auth.verify(message, &signature).unwrap(), "Signature should be valid");
        assert!(!auth.verify(b"wrong message", &signature).unwrap(), "Signature should be invalid for wrong message");
    }

    #[test]
    fn test_verify_with_peer_key() {
        let local = Ed25519Authenticator::generate();
        let peer = Ed25519Authenticator::generate();

        let signature = peer.sign(b"announce").unwrap();
        assert!(local.verify_with_key(b"announce", &signature, &peer.public_key()).unwrap());
        assert!(!local.verify_with_key(b"announce", &signature, &local.public_key()).unwrap());
        assert!(local.verify_with_key(b"announce", &signature, &[1, 2, 3]).is_err());
        assert!(local.verify_with_key(b"announce", &[0u8; 10], &peer.public_key()).is_err());
    }

    #[test]
    fn test_seed_round_trip() {
        let auth = Ed25519Authenticator::generate();
        let restored = Ed25519Authenticator::from_bytes(&auth.to_bytes()).unwrap();
        assert_eq!(auth.public_key(), restored.public_key());
        assert!(Ed25519Authenticator::from_bytes(&[0u8; 5]).is_err());
    }
}
