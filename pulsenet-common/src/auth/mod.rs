pub mod ed25519;

use crate::error::Result;

/// Signs outbound data and verifies signatures made by this or other nodes.
pub trait Authenticator: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Verifies a signature made with this authenticator's own key.
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool>;

    /// Verifies a signature against a peer's declared public key.
    fn verify_with_key(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool>;

    fn public_key(&self) -> Vec<u8>;
}
