// POOLS AND STAKE POSITIONS
// Per-pool and per-(pool, staker) records owned by the stake ledger.
//
// SAFETY INVARIANTS:
// 1. A position's history maps "epoch from which an amount is effective" to that amount;
//    changes made during epoch N take effect from epoch N + 1
// 2. The amount recorded for the latest history key always equals the live amount
// 3. An empty pool (zero validator self-stake) carries no delegator stake
// 4. Reward shares never exceed the recorded pool reward

use posdao_core::{mul_div, percent_of, Address, Amount, EpochNumber};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle of a staking pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    /// Self-stake at or above the candidate minimum; can be elected.
    Active,

    /// Owner asked to leave while still (pending) validator; becomes
    /// inactive at the next epoch switch.
    ToBeRemoved,

    /// Not electable. Stakes can still be withdrawn.
    Inactive,
}

/// A validator candidate's staking account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    /// Staking address (pool identifier, owner of the self-stake)
    pub staking: Address,

    /// Mining address the node signs blocks with
    pub mining: Address,

    pub status: PoolStatus,

    /// Sum of every live position in this pool
    pub total_stake: Amount,

    /// Delegators holding live or ordered stake
    pub delegators: BTreeSet<Address>,

    /// Election weight: total stake x bonus score (0 unless Active)
    pub likelihood: u128,

    /// First epoch in which this pool had stake counted
    pub first_staked_epoch: EpochNumber,

    /// Epoch from which the pool holds no stake at all, if it emptied
    pub last_staked_epoch: Option<EpochNumber>,
}

impl Pool {
    pub fn new(staking: Address, mining: Address, first_staked_epoch: EpochNumber) -> Self {
        Pool {
            staking,
            mining,
            status: PoolStatus::Active,
            total_stake: 0,
            delegators: BTreeSet::new(),
            likelihood: 0,
            first_staked_epoch,
            last_staked_epoch: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PoolStatus::Active
    }

    /// Epoch range `[first, last)` in which rewards can exist for this pool.
    pub fn staked_range(&self, current_epoch: EpochNumber) -> (EpochNumber, EpochNumber) {
        let end = self.last_staked_epoch.unwrap_or(current_epoch).min(current_epoch);
        (self.first_staked_epoch, end)
    }
}

/// One staker's position in one pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StakePosition {
    /// Live stake.
    pub amount: Amount,

    /// Stake added during `staked_epoch`; instantly withdrawable even from
    /// validator pools.
    pub staked_in_epoch: Amount,
    pub staked_epoch: EpochNumber,

    /// Stake scheduled for withdrawal, claimable once the epoch after
    /// `ordered_epoch` has started.
    pub ordered_amount: Amount,
    pub ordered_epoch: EpochNumber,

    /// amount effective from the start of each key epoch
    pub history: BTreeMap<EpochNumber, Amount>,

    /// Every reward epoch below the cursor has been settled.
    pub claim_cursor: EpochNumber,

    /// Epochs at or above the cursor claimed out of order.
    pub claimed: BTreeSet<EpochNumber>,
}

impl StakePosition {
    /// Stake that counted for rewards in `epoch`.
    pub fn amount_at(&self, epoch: EpochNumber) -> Amount {
        self.history.range(..=epoch).next_back().map(|(_, amount)| *amount).unwrap_or(0)
    }

    pub fn added_in(&self, epoch: EpochNumber) -> Amount {
        if self.staked_epoch == epoch {
            self.staked_in_epoch
        } else {
            0
        }
    }

    pub fn note_added(&mut self, epoch: EpochNumber, amount: Amount) {
        if self.staked_epoch != epoch {
            self.staked_epoch = epoch;
            self.staked_in_epoch = 0;
        }
        self.staked_in_epoch = self.staked_in_epoch.saturating_add(amount);
    }

    pub fn note_removed(&mut self, epoch: EpochNumber, amount: Amount) {
        if self.staked_epoch == epoch {
            self.staked_in_epoch = self.staked_in_epoch.saturating_sub(amount);
        }
    }

    /// Record the live amount as effective from the next epoch.
    pub fn checkpoint(&mut self, current_epoch: EpochNumber) {
        self.history.insert(current_epoch + 1, self.amount);
    }

    /// First epoch with non-zero counted stake.
    pub fn first_staked_epoch(&self) -> Option<EpochNumber> {
        self.history.iter().find(|(_, amount)| **amount > 0).map(|(epoch, _)| *epoch)
    }

    /// Epoch from which the position has been empty, if it is empty now.
    pub fn emptied_since(&self) -> Option<EpochNumber> {
        match self.history.iter().next_back() {
            Some((epoch, 0)) => Some(*epoch),
            _ => None,
        }
    }

    pub fn is_claimed(&self, epoch: EpochNumber) -> bool {
        epoch < self.claim_cursor || self.claimed.contains(&epoch)
    }

    /// Move the cursor forward and drop history that can no longer be read.
    pub fn settle_until(&mut self, cursor: EpochNumber) {
        if cursor <= self.claim_cursor {
            return;
        }
        self.claim_cursor = cursor;
        self.claimed = self.claimed.split_off(&cursor);

        // keep the newest entry at or below the cursor, it still defines amount_at(cursor)
        if let Some(floor) = self.history.range(..=cursor).next_back().map(|(epoch, _)| *epoch) {
            self.history = self.history.split_off(&floor);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.amount == 0 && self.ordered_amount == 0
    }
}

/// Stake distribution of a pool at the start of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub total_stake: Amount,
    pub validator_stake: Amount,
}

/// Reward booked for a pool for one epoch, with everything a claim needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochPoolReward {
    pub epoch: EpochNumber,
    pub reward: Amount,
    pub snapshot: PoolSnapshot,
    /// validator floor in force when the reward was booked
    pub validator_min_reward_percent: u64,
}

impl EpochPoolReward {
    fn floor(&self) -> Amount {
        percent_of(self.reward, self.validator_min_reward_percent)
    }

    /// The validator's guaranteed floor plus its proportional part of the rest.
    pub fn validator_share(&self) -> Amount {
        if self.snapshot.total_stake == 0 {
            return 0;
        }
        let floor = self.floor();
        let rest = self.reward.saturating_sub(floor);
        let proportional =
            mul_div(rest, self.snapshot.validator_stake, self.snapshot.total_stake).unwrap_or(0);
        floor.saturating_add(proportional)
    }

    /// A delegator's proportional part of the reward left after the floor.
    pub fn delegator_share(&self, delegator_stake: Amount) -> Amount {
        if self.snapshot.total_stake == 0 {
            return 0;
        }
        let rest = self.reward.saturating_sub(self.floor());
        mul_div(rest, delegator_stake, self.snapshot.total_stake).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reward(amount: Amount, validator: Amount, total: Amount, floor: u64) -> EpochPoolReward {
        EpochPoolReward {
            epoch: 5,
            reward: amount,
            snapshot: PoolSnapshot { total_stake: total, validator_stake: validator },
            validator_min_reward_percent: floor,
        }
    }

    #[test]
    fn test_validator_floor_then_proportional() {
        let r = reward(1000, 100, 150, 30);
        assert_eq!(r.validator_share(), 766);
        assert_eq!(r.delegator_share(50), 233);
        assert!(r.validator_share() + r.delegator_share(50) <= 1000);
    }

    #[test]
    fn test_solo_validator_gets_everything() {
        let r = reward(999, 10, 10, 30);
        assert_eq!(r.validator_share(), 999);
    }

    #[test]
    fn test_empty_snapshot_pays_nothing() {
        let r = reward(1000, 0, 0, 30);
        assert_eq!(r.validator_share(), 0);
        assert_eq!(r.delegator_share(10), 0);
    }

    #[test]
    fn test_history_lookup() {
        let mut p = StakePosition::default();
        p.amount = 100;
        p.checkpoint(2);
        p.amount = 40;
        p.checkpoint(5);

        assert_eq!(p.amount_at(2), 0);
        assert_eq!(p.amount_at(3), 100);
        assert_eq!(p.amount_at(5), 100);
        assert_eq!(p.amount_at(6), 40);
        assert_eq!(p.first_staked_epoch(), Some(3));
        assert_eq!(p.emptied_since(), None);

        p.amount = 0;
        p.checkpoint(8);
        assert_eq!(p.emptied_since(), Some(9));
    }

    #[test]
    fn test_settle_compacts_history() {
        let mut p = StakePosition::default();
        for (epoch, amount) in [(1, 10), (3, 20), (6, 30)] {
            p.amount = amount;
            p.checkpoint(epoch);
        }
        p.claimed.insert(4);
        p.claimed.insert(9);

        p.settle_until(5);
        assert_eq!(p.claim_cursor, 5);
        assert_eq!(p.amount_at(5), 20);
        assert_eq!(p.amount_at(7), 30);
        assert_eq!(p.history.len(), 2);
        assert!(p.is_claimed(4));
        assert!(p.is_claimed(9));
        assert!(!p.is_claimed(6));
        assert_eq!(p.claimed.len(), 1);
    }

    #[test]
    fn test_added_in_resets_each_epoch() {
        let mut p = StakePosition::default();
        p.note_added(3, 50);
        p.note_added(3, 25);
        assert_eq!(p.added_in(3), 75);
        p.note_removed(3, 30);
        assert_eq!(p.added_in(3), 45);
        assert_eq!(p.added_in(4), 0);
        p.note_added(4, 5);
        assert_eq!(p.added_in(4), 5);
        assert_eq!(p.added_in(3), 0);
    }
}
