// EPOCH CLOCK
// Time-based staking epoch boundaries, evaluated lazily against block time.
//
// SAFETY INVARIANTS:
// 1. The epoch counter only moves forward (begin_next_epoch is the sole mutator)
// 2. Every boundary is a pure function of (start_time, fixed_duration, windows)
// 3. The transition window and the stake-disallow window both fit inside one epoch
// 4. All honest nodes compute identical windows for the same block timestamp

use crate::types::{EpochNumber, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EpochConfigError {
    #[error("fixed epoch duration must be > 0")]
    ZeroDuration,
    #[error("transition window {window} must be shorter than the epoch duration {duration}")]
    TransitionWindowTooLong { window: u64, duration: u64 },
    #[error("withdraw disallow period {period} must be shorter than the epoch duration {duration}")]
    DisallowPeriodTooLong { period: u64, duration: u64 },
}

/// Durations that shape every epoch. Fixed at genesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSettings {
    /// Target epoch length in seconds.
    pub fixed_duration: u64,

    /// Length of the window before the epoch end during which the next
    /// committee is elected but not yet active.
    pub transition_window: u64,

    /// Length of the window before the epoch end during which staking and
    /// instant withdrawals are rejected.
    pub withdraw_disallow_period: u64,
}

impl Default for EpochSettings {
    fn default() -> Self {
        EpochSettings {
            fixed_duration: 12 * 60 * 60,
            transition_window: 2 * 60 * 60,
            withdraw_disallow_period: 60 * 60,
        }
    }
}

impl EpochSettings {
    pub fn new(
        fixed_duration: u64,
        transition_window: u64,
        withdraw_disallow_period: u64,
    ) -> Result<Self, EpochConfigError> {
        let settings = EpochSettings { fixed_duration, transition_window, withdraw_disallow_period };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), EpochConfigError> {
        if self.fixed_duration == 0 {
            return Err(EpochConfigError::ZeroDuration);
        }
        if self.transition_window >= self.fixed_duration {
            return Err(EpochConfigError::TransitionWindowTooLong {
                window: self.transition_window,
                duration: self.fixed_duration,
            });
        }
        if self.withdraw_disallow_period >= self.fixed_duration {
            return Err(EpochConfigError::DisallowPeriodTooLong {
                period: self.withdraw_disallow_period,
                duration: self.fixed_duration,
            });
        }
        Ok(())
    }
}

/// The running epoch: counter plus the block/time it started at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochClock {
    pub settings: EpochSettings,
    pub staking_epoch: EpochNumber,
    pub start_time: Timestamp,
    pub start_block: u64,
}

impl EpochClock {
    pub fn genesis(settings: EpochSettings, start_time: Timestamp, start_block: u64) -> Self {
        EpochClock { settings, staking_epoch: 0, start_time, start_block }
    }

    /// Scheduled end of the current epoch.
    pub fn end_time(&self) -> Timestamp {
        self.start_time.saturating_add(self.settings.fixed_duration)
    }

    /// Moment the next committee starts being elected.
    pub fn transition_start(&self) -> Timestamp {
        self.end_time().saturating_sub(self.settings.transition_window)
    }

    /// Staking and instant withdrawals are open from the epoch start until
    /// the disallow period before the scheduled end.
    pub fn stake_and_withdraw_allowed(&self, now: Timestamp) -> bool {
        let closes_at = self.end_time().saturating_sub(self.settings.withdraw_disallow_period);
        now >= self.start_time && now < closes_at
    }

    pub fn is_past_end(&self, now: Timestamp) -> bool {
        now >= self.end_time()
    }

    /// Seconds elapsed since the epoch started.
    pub fn elapsed(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.start_time)
    }

    /// Advance to the next epoch starting at `start_time`.
    pub fn begin_next_epoch(&mut self, start_time: Timestamp, start_block: u64) {
        self.staking_epoch += 1;
        self.start_time = start_time;
        self.start_block = start_block;
    }
}
