// EPOCH PHASE TIMELINE
// Which part of the staking epoch the chain is in, derived from block time.
//
// SAFETY INVARIANTS:
// 1. Exactly one phase is active at a time
// 2. Phases only move Regular -> Transition -> Ended -> Regular(next epoch)
// 3. The pending validator set is non-empty only in Transition and Ended

use posdao_core::{EpochClock, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpochPhase {
    /// Current committee validates, nothing pending.
    Regular,

    /// Next committee elected, waiting for the epoch end and its threshold key.
    Transition,

    /// Scheduled end passed (or forced early); waiting for the key to finalize.
    Ended,
}

impl EpochPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpochPhase::Regular => "REGULAR",
            EpochPhase::Transition => "TRANSITION",
            EpochPhase::Ended => "ENDED",
        }
    }

    /// Phase the timeline alone implies at `now` for a clock, without early-end overrides.
    pub fn scheduled(clock: &EpochClock, now: Timestamp) -> Self {
        if clock.is_past_end(now) {
            EpochPhase::Ended
        } else if now >= clock.transition_start() {
            EpochPhase::Transition
        } else {
            EpochPhase::Regular
        }
    }

    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_advance_to(&self, next: EpochPhase) -> bool {
        matches!(
            (self, next),
            (EpochPhase::Regular, EpochPhase::Transition)
                | (EpochPhase::Transition, EpochPhase::Ended)
                | (EpochPhase::Ended, EpochPhase::Regular)
        )
    }
}
