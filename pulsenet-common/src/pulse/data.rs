use std::fmt;

use serde::{Deserialize, Serialize};

use super::entropy::Bits256;
use super::number::PulseNumber;
use crate::crypto::hash::digest_bytes;
use crate::error::PulseError;
use crate::utils::time::current_time;

pub const INVALID_PULSE_EPOCH: u32 = 0;
pub const EPHEMERAL_PULSE_EPOCH: u32 = INVALID_PULSE_EPOCH + 1;

/// Immutable description of one pulse.
///
/// A pulse with `next_delta == 0` is *expected*: its number is known but the
/// pulse itself has not been realized yet. A pulse with `prev_delta == 0` is
/// the first pulse of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PulseData {
    pub number: PulseNumber,
    pub epoch: u32,
    pub entropy: Bits256,
    pub timestamp: u32,
    pub next_delta: u16,
    pub prev_delta: u16,
}

impl PulseData {
    /// First pulse of a pulsar chain, numbered after the current time.
    pub fn new_first_pulsar(delta: u16, entropy: Bits256) -> Result<Self, PulseError> {
        let number = PulseNumber::of_unix_time(current_time())?;
        Self::new_pulsar_data(number, delta, entropy)
    }

    pub fn new_pulsar(
        number: PulseNumber,
        next_delta: u16,
        prev_delta: u16,
        entropy: Bits256,
    ) -> Result<Self, PulseError> {
        let mut data = Self::new_pulsar_data(number, next_delta, entropy)?;
        data.prev_delta = prev_delta;
        Ok(data)
    }

    /// First pulse of an ephemeral chain, used before any pulsar is available.
    pub fn new_first_ephemeral() -> Self {
        Self::new_ephemeral_data(PulseNumber::MIN_TIME)
    }

    fn new_pulsar_data(number: PulseNumber, delta: u16, entropy: Bits256) -> Result<Self, PulseError> {
        if delta == 0 {
            return Err(PulseError::ZeroDelta);
        }
        if !number.is_time_pulse() {
            return Err(PulseError::OutOfRange(number.as_u32()));
        }
        Ok(PulseData {
            number,
            epoch: number.as_u32(),
            entropy,
            timestamp: current_time() as u32,
            next_delta: delta,
            prev_delta: 0,
        })
    }

    fn new_ephemeral_data(number: PulseNumber) -> Self {
        PulseData {
            number,
            epoch: EPHEMERAL_PULSE_EPOCH,
            entropy: Self::fixed_pulse_entropy(number),
            timestamp: 0,
            next_delta: 1,
            prev_delta: 0,
        }
    }

    /// Entropy of an ephemeral pulse. Must stay byte-stable across versions.
    pub fn fixed_pulse_entropy(number: PulseNumber) -> Bits256 {
        Bits256::static_noise(number.as_u32())
    }

    pub fn is_empty(&self) -> bool {
        self.number.is_unknown()
    }

    pub fn is_valid_pulse_data(&self) -> bool {
        self.number.is_time_pulse()
            && PulseNumber::new(self.epoch).is_special_or_time_pulse()
            && self.next_delta != 0
    }

    pub fn is_valid_expected_pulse_data(&self) -> bool {
        self.number.is_time_pulse()
            && PulseNumber::new(self.epoch).is_special_or_time_pulse()
            && self.prev_delta == 0
    }

    pub fn is_valid_pulsar_data(&self) -> bool {
        PulseNumber::new(self.epoch).is_time_pulse() && self.is_valid_pulse_data()
    }

    pub fn is_valid_ephemeral_data(&self) -> bool {
        self.epoch == EPHEMERAL_PULSE_EPOCH && self.is_valid_pulse_data()
    }

    pub fn is_from_pulsar(&self) -> bool {
        self.number.is_time_pulse() && PulseNumber::new(self.epoch).is_time_pulse()
    }

    pub fn is_from_ephemeral(&self) -> bool {
        self.number.is_time_pulse() && self.epoch == EPHEMERAL_PULSE_EPOCH
    }

    pub fn is_expected_pulse(&self) -> bool {
        self.number.is_time_pulse() && self.next_delta == 0
    }

    pub fn is_first_pulse(&self) -> bool {
        self.number.is_time_pulse() && self.prev_delta == 0
    }

    pub fn start_of_epoch(&self) -> PulseNumber {
        if self.number.is_time_pulse() {
            PulseNumber::new(self.epoch)
        } else {
            self.number
        }
    }

    pub fn next_pulse_number(&self) -> Result<PulseNumber, PulseError> {
        if self.is_expected_pulse() {
            return Err(PulseError::ExpectedPulse(self.number.as_u32()));
        }
        self.number.next(self.next_delta)
    }

    pub fn prev_pulse_number(&self) -> Result<PulseNumber, PulseError> {
        if self.is_first_pulse() {
            return Err(PulseError::FirstPulse(self.number.as_u32()));
        }
        self.number.prev(self.prev_delta)
    }

    /// Produces the successor of this pulse. Ephemeral pulses ignore
    /// `entropy_fn` and derive their successor deterministically.
    pub fn create_next_pulse<F>(&self, entropy_fn: F) -> Result<PulseData, PulseError>
    where
        F: FnOnce() -> Bits256,
    {
        if self.is_from_ephemeral() {
            return self.build_next_ephemeral();
        }
        self.build_next_pulsar(self.next_delta, entropy_fn)
    }

    pub fn create_next_ephemeral_pulse(&self) -> Result<PulseData, PulseError> {
        if !self.is_from_ephemeral() {
            return Err(PulseError::NotEphemeral(self.number.as_u32()));
        }
        self.build_next_ephemeral()
    }

    pub fn create_next_pulsar_pulse<F>(&self, delta: u16, entropy_fn: F) -> Result<PulseData, PulseError>
    where
        F: FnOnce() -> Bits256,
    {
        if self.is_from_ephemeral() {
            return Err(PulseError::Ephemeral(self.number.as_u32()));
        }
        self.build_next_pulsar(delta, entropy_fn)
    }

    fn build_next_ephemeral(&self) -> Result<PulseData, PulseError> {
        let mut next = Self::new_ephemeral_data(self.next_pulse_number()?);
        next.prev_delta = self.next_delta;
        Ok(next)
    }

    fn build_next_pulsar<F>(&self, delta: u16, entropy_fn: F) -> Result<PulseData, PulseError>
    where
        F: FnOnce() -> Bits256,
    {
        let number = self.next_pulse_number()?;
        let mut next = Self::new_pulsar_data(number, delta, entropy_fn())?;
        next.prev_delta = self.next_delta;
        Ok(next)
    }

    /// Placeholder for the successor: number and back-pointer only.
    pub fn create_next_expected(&self) -> Result<PulseData, PulseError> {
        let epoch = if self.is_from_ephemeral() { self.epoch } else { INVALID_PULSE_EPOCH };
        Ok(PulseData {
            number: self.next_pulse_number()?,
            epoch,
            entropy: Bits256::ZERO,
            timestamp: 0,
            next_delta: 0,
            prev_delta: self.next_delta,
        })
    }

    pub fn is_valid_next(&self, next: &PulseData) -> bool {
        if self.is_expected_pulse() || self.next_delta != next.prev_delta {
            return false;
        }
        match self.next_pulse_number() {
            Ok(number) if number == next.number => {}
            _ => return false,
        }
        if self.is_from_pulsar() {
            next.is_valid_pulsar_data()
        } else if self.is_from_ephemeral() {
            next.is_valid_ephemeral_data()
        } else {
            next.is_valid_pulse_data()
        }
    }

    pub fn is_valid_prev(&self, prev: &PulseData) -> bool {
        if self.is_first_pulse() || prev.is_expected_pulse() || prev.next_delta != self.prev_delta {
            return false;
        }
        match prev.next_pulse_number() {
            Ok(number) if number == self.number => {}
            _ => return false,
        }
        if self.is_from_pulsar() {
            prev.is_valid_pulsar_data()
        } else if self.is_from_ephemeral() {
            prev.is_valid_ephemeral_data()
        } else {
            prev.is_valid_pulse_data()
        }
    }

    /// Fixed little-endian layout used for hashing and signing.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(48);
        buf.extend_from_slice(&self.number.as_u32().to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(self.entropy.as_bytes());
        buf.extend_from_slice(&self.next_delta.to_le_bytes());
        buf.extend_from_slice(&self.prev_delta.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn digest(&self) -> [u8; 32] {
        digest_bytes(&self.to_bytes())
    }
}

impl fmt::Display for PulseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number)?;
        let epoch = PulseNumber::new(self.epoch);
        if epoch != self.number && !epoch.is_unknown() {
            write!(f, "@{}", self.epoch)?;
        }
        if self.next_delta == self.prev_delta {
            write!(f, ",±{}", self.next_delta)?;
        } else {
            if self.next_delta > 0 {
                write!(f, ",+{}", self.next_delta)?;
            }
            if self.prev_delta > 0 {
                write!(f, ",-{}", self.prev_delta)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pulsar_at(number: u32, next: u16, prev: u16) -> PulseData {
        PulseData::new_pulsar(PulseNumber::new(number), next, prev, Bits256::random()).unwrap()
    }

    #[test]
    fn test_first_ephemeral() {
        let p = PulseData::new_first_ephemeral();
        assert_eq!(p.number, PulseNumber::MIN_TIME);
        assert!(p.is_from_ephemeral());
        assert!(!p.is_from_pulsar());
        assert!(p.is_first_pulse());
        assert!(p.is_valid_ephemeral_data());
        assert_eq!(p.entropy, PulseData::fixed_pulse_entropy(p.number));
    }

    #[test]
    fn test_ephemeral_chain_is_deterministic() {
        let a = PulseData::new_first_ephemeral();
        let next_a = a.create_next_pulse(Bits256::random).unwrap();
        let next_b = a.create_next_pulse(Bits256::random).unwrap();
        assert_eq!(next_a, next_b);
        assert_eq!(next_a.prev_delta, a.next_delta);
        assert!(a.is_valid_next(&next_a));
        assert!(next_a.is_valid_prev(&a));
    }

    #[test]
    fn test_pulsar_zero_delta_fails() {
        let p = pulsar_at(70000, 10, 0);
        let err = p.create_next_pulsar_pulse(0, Bits256::random).unwrap_err();
        assert_eq!(err, PulseError::ZeroDelta);
        assert_eq!(
            PulseData::new_pulsar(PulseNumber::new(70000), 0, 0, Bits256::ZERO).unwrap_err(),
            PulseError::ZeroDelta
        );
    }

    #[test]
    fn test_pulsar_next() {
        let p = pulsar_at(70000, 10, 0);
        let entropy = Bits256::random();
        let next = p.create_next_pulse(|| entropy).unwrap();
        assert_eq!(next.number.as_u32(), 70010);
        assert_eq!(next.entropy, entropy);
        assert_eq!(next.prev_delta, 10);
        assert!(next.is_from_pulsar());
        assert!(p.is_valid_next(&next));
        assert!(next.is_valid_prev(&p));
    }

    #[test]
    fn test_lineage_mismatch_is_invalid() {
        let ephemeral = PulseData::new_first_ephemeral();
        assert!(ephemeral.create_next_pulsar_pulse(1, Bits256::random).is_err());
        let pulsar = pulsar_at(70000, 10, 0);
        assert!(pulsar.create_next_ephemeral_pulse().is_err());

        let mut forged = pulsar.create_next_pulse(Bits256::random).unwrap();
        forged.epoch = EPHEMERAL_PULSE_EPOCH;
        assert!(!pulsar.is_valid_next(&forged));
    }

    #[test]
    fn test_delta_mismatch_is_invalid() {
        let p = pulsar_at(70000, 10, 0);
        let mut next = p.create_next_pulse(Bits256::random).unwrap();
        next.prev_delta = 5;
        assert!(!p.is_valid_next(&next));
        let skipped = pulsar_at(70020, 10, 10);
        assert!(!p.is_valid_next(&skipped));
    }

    #[test]
    fn test_expected_pulse() {
        let p = pulsar_at(70000, 10, 0);
        let expected = p.create_next_expected().unwrap();
        assert!(expected.is_expected_pulse());
        assert_eq!(expected.epoch, INVALID_PULSE_EPOCH);
        assert_eq!(expected.number.as_u32(), 70010);
        assert_eq!(expected.prev_delta, 10);
        assert!(!p.is_valid_next(&expected));
        assert!(expected.create_next_pulse(Bits256::random).is_err());

        let eph = PulseData::new_first_ephemeral().create_next_expected().unwrap();
        assert!(eph.is_expected_pulse());
        assert_eq!(eph.epoch, EPHEMERAL_PULSE_EPOCH);
    }

    #[test]
    fn test_zero_number_is_invalid() {
        let mut p = pulsar_at(70000, 10, 0);
        p.number = PulseNumber::UNKNOWN;
        assert!(p.is_empty());
        assert!(!p.is_valid_pulse_data());
        assert!(!p.is_valid_pulsar_data());
    }

    #[test]
    fn test_first_pulse_has_no_prev() {
        let p = pulsar_at(70000, 10, 0);
        assert!(p.prev_pulse_number().is_err());
        let other = pulsar_at(69990, 10, 0);
        assert!(!p.is_valid_prev(&other));
    }

    #[test]
    fn test_display() {
        assert_eq!(pulsar_at(70000, 10, 10).to_string(), "70000,±10");
        assert_eq!(pulsar_at(70000, 10, 0).to_string(), "70000,+10");
        assert_eq!(PulseData::new_first_ephemeral().to_string(), "65537@1,+1");
    }

    #[test]
    fn test_digest_changes_with_entropy() {
        let p = pulsar_at(70000, 10, 0);
        let mut q = p;
        q.entropy = Bits256::random();
        assert_ne!(p.digest(), q.digest());
        assert_eq!(p.digest(), p.digest());
    }

    proptest! {
        #[test]
        fn prop_pulsar_chain_is_consistent(start in 65537u32..1_000_000, delta in 1u16..1000, steps in 1usize..20) {
            let mut current = PulseData::new_pulsar(PulseNumber::new(start), delta, 0, Bits256::ZERO).unwrap();
            for _ in 0..steps {
                let next = current.create_next_pulse(Bits256::random).unwrap();
                prop_assert_eq!(next.prev_delta, current.next_delta);
                prop_assert!(current.is_valid_next(&next));
                prop_assert!(next.is_valid_prev(&current));
                current = next;
            }
        }

        #[test]
        fn prop_ephemeral_entropy_is_pure(number in 65537u32..1_000_000) {
            let pn = PulseNumber::new(number);
            prop_assert_eq!(PulseData::fixed_pulse_entropy(pn), PulseData::fixed_pulse_entropy(pn));
        }
    }
}
