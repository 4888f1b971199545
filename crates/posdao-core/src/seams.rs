// Read-only views one component exposes to another. The engine wires them
// together per call, so no component ever holds a reference to another.

use crate::types::{Address, Timestamp};

/// Bonus score lookup, consumed by the stake ledger when it (re)computes a
/// pool's election likelihood.
pub trait ScoreSource {
    fn score_of(&self, mining: &Address) -> u64;
}

/// Validator-set facts the stake ledger needs to decide what a staker may do.
pub trait ValidatorStatus {
    /// Mining address is in the current or the pending validator set.
    fn is_validator_or_pending(&self, mining: &Address) -> bool;

    /// Mining address is banned at `now`.
    fn is_banned(&self, mining: &Address, now: Timestamp) -> bool;
}

/// Fixed score for every address. Used by genesis setup and tests.
#[derive(Debug, Clone, Copy)]
pub struct FlatScore(pub u64);

impl ScoreSource for FlatScore {
    fn score_of(&self, _mining: &Address) -> u64 {
        self.0
    }
}

/// No validators, nobody banned.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoValidators;

impl ValidatorStatus for NoValidators {
    fn is_validator_or_pending(&self, _mining: &Address) -> bool {
        false
    }

    fn is_banned(&self, _mining: &Address, _now: Timestamp) -> bool {
        false
    }
}
