// Threshold key generation gate. The key-generation history lives outside
// this engine; rotation only consumes its pass/fail signal.

use posdao_core::{Address, EpochNumber};
use std::collections::BTreeSet;

pub trait KeyGenHistory {
    /// A threshold key for `pending` is ready for `epoch`.
    fn is_key_ready(&self, epoch: EpochNumber, pending: &[Address]) -> bool;

    /// Pending validators that never wrote their key parts / acks for `epoch`.
    fn missing_key_writers(&self, epoch: EpochNumber, pending: &[Address]) -> Vec<Address>;
}

/// Key generation that always succeeds immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstantKeyGen;

impl KeyGenHistory for InstantKeyGen {
    fn is_key_ready(&self, _epoch: EpochNumber, _pending: &[Address]) -> bool {
        true
    }

    fn missing_key_writers(&self, _epoch: EpochNumber, _pending: &[Address]) -> Vec<Address> {
        Vec::new()
    }
}

/// Key generation that completes only when every pending validator wrote its part.
#[derive(Debug, Clone, Default)]
pub struct RecordedKeyGen {
    written: BTreeSet<(EpochNumber, Address)>,
}

impl RecordedKeyGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_part(&mut self, epoch: EpochNumber, mining: Address) {
        self.written.insert((epoch, mining));
    }
}

impl KeyGenHistory for RecordedKeyGen {
    fn is_key_ready(&self, epoch: EpochNumber, pending: &[Address]) -> bool {
        !pending.is_empty() && self.missing_key_writers(epoch, pending).is_empty()
    }

    fn missing_key_writers(&self, epoch: EpochNumber, pending: &[Address]) -> Vec<Address> {
        pending.iter().filter(|m| !self.written.contains(&(epoch, **m))).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_key_gen() {
        let a = Address::from_low_u64(1);
        let b = Address::from_low_u64(2);
        let mut kg = RecordedKeyGen::new();
        kg.write_part(3, a);
        assert!(!kg.is_key_ready(3, &[a, b]));
        assert_eq!(kg.missing_key_writers(3, &[a, b]), vec![b]);
        kg.write_part(3, b);
        assert!(kg.is_key_ready(3, &[a, b]));
        assert!(!kg.is_key_ready(4, &[a, b]));
        assert!(!kg.is_key_ready(3, &[]));
    }
}
