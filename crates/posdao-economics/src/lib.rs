/// POSDAO ECONOMICS
///
/// The money side of the epoch engine:
/// - Stake ledger: pools, delegations, ordered withdrawals, per-epoch snapshots
///   and the lazy reward claim walk
/// - Reward pots: delta / reinsert / undistributed balances drained at epoch end
/// - Bonus score: bounded reputation that weights election likelihood
///
/// The stake ledger is the only writer of stake amounts. The other two
/// components reach it through explicit `&mut StakeLedger` arguments and
/// authenticate with their component address.

pub mod events;
pub mod pool;
pub mod stake_ledger;
pub mod reward_pots;
pub mod bonus_score;

pub use events::LedgerEvent;
pub use pool::{EpochPoolReward, Pool, PoolSnapshot, PoolStatus, StakePosition};
pub use stake_ledger::{LedgerEnv, StakeLedger, StakingError, StakingParams};
pub use reward_pots::{
    EpochRewardInput, EpochRewardSummary, RewardEngine, RewardError, RewardParams, RewardPots,
};
pub use bonus_score::{BonusScoreError, BonusScoreLedger, BonusScoreParams, MAX_SCORE, MIN_SCORE};

/// The three economic ledgers bundled for the orchestrator.
pub mod integration {
    use crate::*;
    use posdao_core::{Address, EpochClock};
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EconomicLedgers {
        pub stake: StakeLedger,
        pub rewards: RewardEngine,
        pub scores: BonusScoreLedger,
    }

    impl EconomicLedgers {
        pub fn genesis(
            clock: EpochClock,
            owner: Address,
            staking: StakingParams,
            reward: RewardParams,
            bonus: BonusScoreParams,
        ) -> Result<Self, EconomicError> {
            Ok(EconomicLedgers {
                stake: StakeLedger::new(staking, owner, clock)?,
                rewards: RewardEngine::new(reward, owner)?,
                scores: BonusScoreLedger::new(bonus, owner, clock.settings.fixed_duration)?,
            })
        }

        /// Check the cross-ledger invariants that must hold between calls.
        pub fn verify_invariants(&self) -> Result<(), EconomicError> {
            self.stake.verify_invariants()?;
            self.rewards.params().validate()?;
            self.scores.params().validate().map_err(BonusScoreError::from)?;
            Ok(())
        }
    }

    #[derive(Debug, Error, Clone, PartialEq, Eq)]
    pub enum EconomicError {
        #[error("Staking error: {0}")]
        Staking(#[from] StakingError),
        #[error("Reward error: {0}")]
        Reward(#[from] RewardError),
        #[error("Bonus score error: {0}")]
        BonusScore(#[from] BonusScoreError),
    }
}
