// Ledger events, buffered until the caller drains them.

use posdao_core::{Address, Amount, EpochNumber};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    AddedPool { staking: Address, mining: Address, amount: Amount },
    RemovedPool { staking: Address, epoch: EpochNumber },
    PlacedStake { pool: Address, staker: Address, epoch: EpochNumber, amount: Amount },
    WithdrewStake { pool: Address, staker: Address, epoch: EpochNumber, amount: Amount },
    MovedStake { from: Address, to: Address, staker: Address, epoch: EpochNumber, amount: Amount },
    OrderedWithdrawal { pool: Address, staker: Address, epoch: EpochNumber, amount: Amount },
    CancelledOrder { pool: Address, staker: Address, epoch: EpochNumber, amount: Amount },
    ClaimedOrderedWithdrawal { pool: Address, staker: Address, epoch: EpochNumber, amount: Amount },
    /// Delegator stake forced into an ordered withdrawal because the pool emptied.
    DelegatorUnbonded { pool: Address, delegator: Address, epoch: EpochNumber, amount: Amount },
    EpochRewardRecorded { pool: Address, epoch: EpochNumber, amount: Amount },
    ClaimedReward { pool: Address, staker: Address, epochs: Vec<EpochNumber>, amount: Amount },
}
