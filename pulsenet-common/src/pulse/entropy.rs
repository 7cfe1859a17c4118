use std::fmt;
use std::ops::BitXor;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// 256 bits of entropy or digest material.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bits256(pub [u8; 32]);

impl Bits256 {
    pub const ZERO: Bits256 = Bits256([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Bits256(bytes)
    }

    /// Fresh entropy from the operating system RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Bits256(bytes)
    }

    /// Deterministic noise keyed by `base`. See [`fill_with_static_noise`].
    pub fn static_noise(base: u32) -> Self {
        let mut bytes = [0u8; 32];
        fill_with_static_noise(base, &mut bytes);
        Bits256(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl BitXor for Bits256 {
    type Output = Bits256;

    fn bitxor(self, rhs: Self) -> Self::Output {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ rhs.0[i];
        }
        Bits256(out)
    }
}

impl fmt::Debug for Bits256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bits256({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Bits256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Fills `out` with a fixed pseudo-random stream derived from `base`.
///
/// The output feeds ephemeral pulse entropy, which every node derives on its
/// own and must agree on. The algorithm (a splitmix64 stream seeded with
/// `base`, emitted little-endian) MUST NOT change.
pub fn fill_with_static_noise(base: u32, out: &mut [u8]) {
    let mut state = u64::from(base);
    for chunk in out.chunks_mut(8) {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        let bytes = z.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}
