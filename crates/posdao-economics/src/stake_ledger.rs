// STAKE LEDGER
// Sole owner of pools, stake positions, per-epoch pool snapshots and booked pool rewards.
//
// SAFETY INVARIANTS:
// 1. A position's live amount equals deposits minus withdrawals minus ordered amounts
// 2. pool.total_stake == sum of the live amounts of every position in the pool
// 3. A pool whose validator self-stake is zero holds no live delegator stake
// 4. Reward claims only read epochs strictly before the current staking epoch
// 5. Booked rewards minus paid claims never goes negative (reward_reserve)
// 6. Every public mutator validates fully before it writes anything

use crate::events::LedgerEvent;
use crate::pool::{EpochPoolReward, Pool, PoolSnapshot, PoolStatus, StakePosition};
use log::{debug, info, warn};
use posdao_core::{
    component, decade_ladder, Address, Amount, BoundedParams, EpochClock, EpochNumber, Guarded,
    NonReentrant, ParamChange, ParamError, ParamValue, ReentrancyError, ScoreSource, Timestamp,
    ValidatorStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StakingError {
    #[error("amount must be > 0")]
    ZeroAmount,

    #[error("zero address")]
    ZeroAddress,

    #[error("staking and mining address must differ")]
    SameStakingAndMining,

    #[error("pool {0} not found")]
    PoolNotFound(Address),

    #[error("pool {0} already exists")]
    PoolAlreadyExists(Address),

    #[error("mining address {0} is already bound to a pool")]
    MiningAddressInUse(Address),

    #[error("pool {0} is not active")]
    PoolNotActive(Address),

    #[error("pool {0} has no validator stake")]
    EmptyPool(Address),

    #[error("pool {0} is banned")]
    PoolBanned(Address),

    #[error("staking and withdrawals are closed at {now}")]
    StakingWindowClosed { now: Timestamp },

    #[error("self-stake {amount} below candidate minimum {minimum}")]
    BelowCandidateMinimum { amount: Amount, minimum: Amount },

    #[error("delegated stake {amount} below delegator minimum {minimum}")]
    BelowDelegatorMinimum { amount: Amount, minimum: Amount },

    #[error("withdrawal of {requested} exceeds allowed {allowed}")]
    WithdrawExceedsAllowed { requested: Amount, allowed: Amount },

    #[error("order of {requested} exceeds allowed {allowed}")]
    OrderExceedsAllowed { requested: Amount, allowed: Amount },

    #[error("cancel of {requested} exceeds ordered {ordered}")]
    CancelExceedsOrdered { requested: Amount, ordered: Amount },

    #[error("nothing ordered for withdrawal")]
    NothingOrdered,

    #[error("ordered withdrawal from epoch {ordered_epoch} matures after it ends")]
    OrderNotMatured { ordered_epoch: EpochNumber },

    #[error("cannot move stake into the same pool")]
    SamePool,

    #[error("{staker} has no stake record in pool {pool}")]
    NoStake { pool: Address, staker: Address },

    #[error("epoch {epoch} is not finished (current epoch {current})")]
    EpochNotFinished { epoch: EpochNumber, current: EpochNumber },

    #[error("snapshot epoch {requested} does not match current epoch {current}")]
    SnapshotEpochMismatch { requested: EpochNumber, current: EpochNumber },

    #[error("no stake snapshot for pool {pool} in epoch {epoch}")]
    MissingSnapshot { pool: Address, epoch: EpochNumber },

    #[error("pool {pool} already rewarded for epoch {epoch}")]
    EpochAlreadyRewarded { pool: Address, epoch: EpochNumber },

    #[error("reward reserve {reserve} cannot cover payout {payout}")]
    RewardReserveExhausted { reserve: Amount, payout: Amount },

    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("caller {0} is not authorized")]
    Unauthorized(Address),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Reentrancy(#[from] ReentrancyError),
}

/// Staking thresholds. Both are tunable through the bounded registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingParams {
    /// Minimum self-stake of an active pool.
    pub candidate_min_stake: Amount,

    /// Minimum stake of one delegator in one pool.
    pub delegator_min_stake: Amount,
}

impl Default for StakingParams {
    fn default() -> Self {
        StakingParams {
            candidate_min_stake: 10u128.pow(22),
            delegator_min_stake: 10u128.pow(20),
        }
    }
}

impl StakingParams {
    pub const CANDIDATE_MIN_STAKE: &'static str = "candidate_min_stake";
    pub const DELEGATOR_MIN_STAKE: &'static str = "delegator_min_stake";

    pub fn registry() -> Result<BoundedParams<StakingParams>, ParamError> {
        BoundedParams::<StakingParams>::new()
            .register(
                Self::CANDIDATE_MIN_STAKE,
                |p| p.candidate_min_stake,
                |p, v| p.candidate_min_stake = v,
                decade_ladder(24),
            )?
            .register(
                Self::DELEGATOR_MIN_STAKE,
                |p| p.delegator_min_stake,
                |p, v| p.delegator_min_stake = v,
                decade_ladder(24),
            )
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        Self::registry()?.verify(self)
    }
}

/// What the ledger needs to know about the outside world for one call.
#[derive(Clone, Copy)]
pub struct LedgerEnv<'a> {
    pub now: Timestamp,
    pub validators: &'a dyn ValidatorStatus,
    pub scores: &'a dyn ScoreSource,
}

impl<'a> LedgerEnv<'a> {
    pub fn new(now: Timestamp, validators: &'a dyn ValidatorStatus, scores: &'a dyn ScoreSource) -> Self {
        LedgerEnv { now, validators, scores }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeLedger {
    params: StakingParams,

    /// Address allowed to change staking parameters
    owner: Address,

    clock: EpochClock,

    /// Pools by staking address
    pools: BTreeMap<Address, Pool>,

    /// mining -> staking
    staking_by_mining: BTreeMap<Address, Address>,

    /// pool -> staker -> position
    positions: BTreeMap<Address, BTreeMap<Address, StakePosition>>,

    /// pool -> epoch -> stake distribution, until the epoch is rewarded
    snapshots: BTreeMap<Address, BTreeMap<EpochNumber, PoolSnapshot>>,

    /// pool -> epoch -> booked reward
    pool_rewards: BTreeMap<Address, BTreeMap<EpochNumber, EpochPoolReward>>,

    /// Booked but not yet claimed rewards
    reward_reserve: Amount,

    #[serde(skip)]
    events: Vec<LedgerEvent>,

    #[serde(skip)]
    guard: NonReentrant,
}

impl Guarded for StakeLedger {
    const COMPONENT: &'static str = "stake ledger";

    fn guard_mut(&mut self) -> &mut NonReentrant {
        &mut self.guard
    }
}

impl StakeLedger {
    pub fn new(params: StakingParams, owner: Address, clock: EpochClock) -> Result<Self, StakingError> {
        params.validate()?;
        Ok(StakeLedger {
            params,
            owner,
            clock,
            pools: BTreeMap::new(),
            staking_by_mining: BTreeMap::new(),
            positions: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            pool_rewards: BTreeMap::new(),
            reward_reserve: 0,
            events: Vec::new(),
            guard: NonReentrant::default(),
        })
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn params(&self) -> &StakingParams {
        &self.params
    }

    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    pub fn staking_epoch(&self) -> EpochNumber {
        self.clock.staking_epoch
    }

    pub fn pool(&self, staking: &Address) -> Option<&Pool> {
        self.pools.get(staking)
    }

    pub fn staking_by_mining(&self, mining: &Address) -> Option<Address> {
        self.staking_by_mining.get(mining).copied()
    }

    pub fn mining_by_staking(&self, staking: &Address) -> Option<Address> {
        self.pools.get(staking).map(|p| p.mining)
    }

    pub fn position(&self, pool: &Address, staker: &Address) -> Option<&StakePosition> {
        self.positions.get(pool).and_then(|m| m.get(staker))
    }

    pub fn stake_amount(&self, pool: &Address, staker: &Address) -> Amount {
        self.position(pool, staker).map(|p| p.amount).unwrap_or(0)
    }

    pub fn ordered_withdraw_amount(&self, pool: &Address, staker: &Address) -> Amount {
        self.position(pool, staker).map(|p| p.ordered_amount).unwrap_or(0)
    }

    pub fn stake_amount_total(&self, pool: &Address) -> Amount {
        self.pools.get(pool).map(|p| p.total_stake).unwrap_or(0)
    }

    pub fn reward_reserve(&self) -> Amount {
        self.reward_reserve
    }

    pub fn snapshot(&self, pool: &Address, epoch: EpochNumber) -> Option<PoolSnapshot> {
        self.snapshots.get(pool).and_then(|m| m.get(&epoch)).copied()
    }

    pub fn epoch_pool_reward(&self, pool: &Address, epoch: EpochNumber) -> Option<&EpochPoolReward> {
        self.pool_rewards.get(pool).and_then(|m| m.get(&epoch))
    }

    fn pools_with(&self, status: PoolStatus) -> Vec<Address> {
        self.pools.values().filter(|p| p.status == status).map(|p| p.staking).collect()
    }

    /// Pools that can be elected.
    pub fn pools(&self) -> Vec<Address> {
        self.pools_with(PoolStatus::Active)
    }

    pub fn pools_inactive(&self) -> Vec<Address> {
        self.pools_with(PoolStatus::Inactive)
    }

    pub fn pools_to_be_removed(&self) -> Vec<Address> {
        self.pools_with(PoolStatus::ToBeRemoved)
    }

    /// Active pools with a non-zero election weight.
    pub fn pools_to_be_elected(&self) -> Vec<Address> {
        self.pools.values().filter(|p| p.is_active() && p.likelihood > 0).map(|p| p.staking).collect()
    }

    /// Election weights of every electable pool and their sum.
    pub fn pools_likelihood(&self) -> (Vec<(Address, u128)>, u128) {
        let weights: Vec<(Address, u128)> = self
            .pools
            .values()
            .filter(|p| p.is_active() && p.likelihood > 0)
            .map(|p| (p.staking, p.likelihood))
            .collect();
        let sum = weights.iter().fold(0u128, |acc, (_, w)| acc.saturating_add(*w));
        (weights, sum)
    }

    pub fn delegators(&self, pool: &Address) -> Vec<Address> {
        self.pools.get(pool).map(|p| p.delegators.iter().copied().collect()).unwrap_or_default()
    }

    /// Drain buffered events.
    pub fn take_events(&mut self) -> Vec<LedgerEvent> {
        std::mem::take(&mut self.events)
    }

    fn is_banned(&self, pool: &Pool, env: &LedgerEnv<'_>) -> bool {
        env.validators.is_banned(&pool.mining, env.now)
    }

    fn existing_pool(&self, staking: &Address) -> Result<&Pool, StakingError> {
        self.pools.get(staking).ok_or(StakingError::PoolNotFound(*staking))
    }

    fn usable_pool(&self, staking: &Address, env: &LedgerEnv<'_>) -> Result<&Pool, StakingError> {
        let pool = self.existing_pool(staking)?;
        if self.is_banned(pool, env) {
            return Err(StakingError::PoolBanned(*staking));
        }
        Ok(pool)
    }

    fn require_window(&self, env: &LedgerEnv<'_>) -> Result<(), StakingError> {
        if !self.clock.stake_and_withdraw_allowed(env.now) {
            return Err(StakingError::StakingWindowClosed { now: env.now });
        }
        Ok(())
    }

    fn require_caller(caller: Address, expected: Address) -> Result<(), StakingError> {
        if caller != expected {
            warn!("Unauthorized stake ledger call from {}", caller);
            return Err(StakingError::Unauthorized(caller));
        }
        Ok(())
    }

    /// Stake that may be withdrawn instantly right now.
    pub fn max_withdraw_allowed(&self, pool: &Address, staker: &Address, env: &LedgerEnv<'_>) -> Amount {
        let Some(p) = self.pools.get(pool) else { return 0 };
        if self.is_banned(p, env) || !self.clock.stake_and_withdraw_allowed(env.now) {
            return 0;
        }
        let Some(position) = self.position(pool, staker) else { return 0 };
        if env.validators.is_validator_or_pending(&p.mining) {
            position.added_in(self.clock.staking_epoch).min(position.amount)
        } else {
            position.amount
        }
    }

    /// Stake that may be ordered for withdrawal. Open during the disallow window too.
    pub fn max_withdraw_order_allowed(&self, pool: &Address, staker: &Address, env: &LedgerEnv<'_>) -> Amount {
        let Some(p) = self.pools.get(pool) else { return 0 };
        if self.is_banned(p, env) {
            return 0;
        }
        let Some(position) = self.position(pool, staker) else { return 0 };
        if env.validators.is_validator_or_pending(&p.mining) {
            position.amount.saturating_sub(position.added_in(self.clock.staking_epoch))
        } else {
            position.amount
        }
    }

    fn check_minimum(&self, pool: &Address, staker: &Address, amount: Amount) -> Result<(), StakingError> {
        if amount == 0 {
            return Ok(());
        }
        if pool == staker {
            if amount < self.params.candidate_min_stake {
                return Err(StakingError::BelowCandidateMinimum {
                    amount,
                    minimum: self.params.candidate_min_stake,
                });
            }
        } else if amount < self.params.delegator_min_stake {
            return Err(StakingError::BelowDelegatorMinimum {
                amount,
                minimum: self.params.delegator_min_stake,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Validation (no writes)
    // ---------------------------------------------------------------------

    fn validate_stake(
        &self,
        pool: &Address,
        staker: &Address,
        amount: Amount,
        env: &LedgerEnv<'_>,
    ) -> Result<(), StakingError> {
        if amount == 0 {
            return Err(StakingError::ZeroAmount);
        }
        if staker.is_zero() {
            return Err(StakingError::ZeroAddress);
        }
        let p = self.usable_pool(pool, env)?;
        self.require_window(env)?;

        let new_amount = self
            .stake_amount(pool, staker)
            .checked_add(amount)
            .ok_or(StakingError::ArithmeticOverflow)?;
        if pool == staker {
            if new_amount < self.params.candidate_min_stake {
                return Err(StakingError::BelowCandidateMinimum {
                    amount: new_amount,
                    minimum: self.params.candidate_min_stake,
                });
            }
        } else {
            if self.stake_amount(pool, pool) == 0 {
                return Err(StakingError::EmptyPool(*pool));
            }
            if !p.is_active() {
                return Err(StakingError::PoolNotActive(*pool));
            }
            self.check_minimum(pool, staker, new_amount)?;
        }
        p.total_stake.checked_add(amount).ok_or(StakingError::ArithmeticOverflow)?;
        Ok(())
    }

    fn validate_withdraw(
        &self,
        pool: &Address,
        staker: &Address,
        amount: Amount,
        env: &LedgerEnv<'_>,
    ) -> Result<(), StakingError> {
        if amount == 0 {
            return Err(StakingError::ZeroAmount);
        }
        self.usable_pool(pool, env)?;
        self.require_window(env)?;

        let allowed = self.max_withdraw_allowed(pool, staker, env);
        if amount > allowed {
            return Err(StakingError::WithdrawExceedsAllowed { requested: amount, allowed });
        }
        self.check_minimum(pool, staker, self.stake_amount(pool, staker) - amount)
    }

    // ---------------------------------------------------------------------
    // Raw writes
    // ---------------------------------------------------------------------

    fn credit(&mut self, pool: Address, staker: Address, amount: Amount) -> Result<(), StakingError> {
        let epoch = self.clock.staking_epoch;
        let position = self.positions.entry(pool).or_default().entry(staker).or_default();
        position.amount = position.amount.checked_add(amount).ok_or(StakingError::ArithmeticOverflow)?;
        position.note_added(epoch, amount);
        position.checkpoint(epoch);

        let p = self.pools.get_mut(&pool).ok_or(StakingError::PoolNotFound(pool))?;
        p.total_stake = p.total_stake.checked_add(amount).ok_or(StakingError::ArithmeticOverflow)?;
        p.last_staked_epoch = None;
        if staker != pool {
            p.delegators.insert(staker);
        }
        Ok(())
    }

    fn debit(&mut self, pool: Address, staker: Address, amount: Amount) -> Result<(), StakingError> {
        let epoch = self.clock.staking_epoch;
        let position = self
            .positions
            .get_mut(&pool)
            .and_then(|m| m.get_mut(&staker))
            .ok_or(StakingError::NoStake { pool, staker })?;
        position.amount = position.amount.checked_sub(amount).ok_or(StakingError::ArithmeticOverflow)?;
        position.note_removed(epoch, amount);
        position.checkpoint(epoch);
        let emptied_position = position.is_empty();

        let p = self.pools.get_mut(&pool).ok_or(StakingError::PoolNotFound(pool))?;
        p.total_stake = p.total_stake.checked_sub(amount).ok_or(StakingError::ArithmeticOverflow)?;
        if p.total_stake == 0 {
            p.last_staked_epoch = Some(epoch + 1);
        }
        if emptied_position && staker != pool {
            p.delegators.remove(&staker);
        }
        Ok(())
    }

    fn refresh_likelihood(&mut self, pool: &Address, scores: &dyn ScoreSource) {
        if let Some(p) = self.pools.get_mut(pool) {
            p.likelihood = if p.is_active() {
                p.total_stake.saturating_mul(scores.score_of(&p.mining) as u128)
            } else {
                0
            };
        }
    }

    /// Retire a pool whose validator self-stake hit zero: it stops being
    /// electable and every delegator's live stake becomes an ordered withdrawal.
    fn empty_pool(&mut self, pool: Address, env: &LedgerEnv<'_>) -> Result<(), StakingError> {
        let epoch = self.clock.staking_epoch;
        let p = self.pools.get_mut(&pool).ok_or(StakingError::PoolNotFound(pool))?;
        p.status = if env.validators.is_validator_or_pending(&p.mining) {
            PoolStatus::ToBeRemoved
        } else {
            PoolStatus::Inactive
        };
        let delegators: Vec<Address> = p.delegators.iter().copied().collect();

        let mut unbonded = 0u128;
        if let Some(stakers) = self.positions.get_mut(&pool) {
            for delegator in delegators {
                let Some(position) = stakers.get_mut(&delegator) else { continue };
                if position.amount == 0 {
                    continue;
                }
                let amount = position.amount;
                position.ordered_amount = position.ordered_amount.saturating_add(amount);
                position.ordered_epoch = epoch;
                position.amount = 0;
                position.note_removed(epoch, amount);
                position.checkpoint(epoch);
                unbonded = unbonded.saturating_add(amount);
                self.events.push(LedgerEvent::DelegatorUnbonded { pool, delegator, epoch, amount });
            }
        }

        let p = self.pools.get_mut(&pool).ok_or(StakingError::PoolNotFound(pool))?;
        p.total_stake = p.total_stake.saturating_sub(unbonded);
        if p.total_stake == 0 {
            p.last_staked_epoch = Some(epoch + 1);
        }
        self.refresh_likelihood(&pool, env.scores);
        self.events.push(LedgerEvent::RemovedPool { staking: pool, epoch });
        info!("Pool {} emptied in epoch {}, {} delegated stake unbonded", pool, epoch, unbonded);
        Ok(())
    }

    fn after_debit(&mut self, pool: Address, staker: Address, env: &LedgerEnv<'_>) -> Result<(), StakingError> {
        if staker == pool && self.stake_amount(&pool, &pool) == 0 {
            self.empty_pool(pool, env)?;
        } else {
            self.refresh_likelihood(&pool, env.scores);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Staker operations
    // ---------------------------------------------------------------------

    /// Register a new candidate pool with its initial self-stake.
    pub fn add_pool(
        &mut self,
        staking: Address,
        mining: Address,
        amount: Amount,
        env: &LedgerEnv<'_>,
    ) -> Result<(), StakingError> {
        self.non_reentrant(|ledger| {
            if staking.is_zero() || mining.is_zero() {
                return Err(StakingError::ZeroAddress);
            }
            if staking == mining {
                return Err(StakingError::SameStakingAndMining);
            }
            if amount == 0 {
                return Err(StakingError::ZeroAmount);
            }
            if ledger.pools.contains_key(&staking) {
                return Err(StakingError::PoolAlreadyExists(staking));
            }
            if ledger.staking_by_mining.contains_key(&mining) || ledger.pools.contains_key(&mining) {
                return Err(StakingError::MiningAddressInUse(mining));
            }
            if env.validators.is_banned(&mining, env.now) {
                return Err(StakingError::PoolBanned(staking));
            }
            ledger.require_window(env)?;
            if amount < ledger.params.candidate_min_stake {
                return Err(StakingError::BelowCandidateMinimum {
                    amount,
                    minimum: ledger.params.candidate_min_stake,
                });
            }

            let epoch = ledger.clock.staking_epoch;
            ledger.pools.insert(staking, Pool::new(staking, mining, epoch + 1));
            ledger.staking_by_mining.insert(mining, staking);
            ledger.credit(staking, staking, amount)?;
            ledger.refresh_likelihood(&staking, env.scores);

            ledger.events.push(LedgerEvent::AddedPool { staking, mining, amount });
            info!("Pool {} (mining {}) added with {} self-stake", staking, mining, amount);
            Ok(())
        })
    }

    /// Genesis pools are registered outside the staking window.
    pub fn add_genesis_pool(
        &mut self,
        staking: Address,
        mining: Address,
        amount: Amount,
        scores: &dyn ScoreSource,
    ) -> Result<(), StakingError> {
        if staking.is_zero() || mining.is_zero() {
            return Err(StakingError::ZeroAddress);
        }
        if amount == 0 {
            return Err(StakingError::ZeroAmount);
        }
        if self.pools.contains_key(&staking) {
            return Err(StakingError::PoolAlreadyExists(staking));
        }
        if self.staking_by_mining.contains_key(&mining) {
            return Err(StakingError::MiningAddressInUse(mining));
        }
        self.check_minimum(&staking, &staking, amount)?;

        // genesis stake counts from epoch 0
        let mut pool = Pool::new(staking, mining, 0);
        pool.total_stake = amount;
        self.pools.insert(staking, pool);
        self.staking_by_mining.insert(mining, staking);
        let position = self.positions.entry(staking).or_default().entry(staking).or_default();
        position.amount = amount;
        position.history.insert(0, amount);
        self.refresh_likelihood(&staking, scores);
        info!("Genesis pool {} (mining {}) with {} self-stake", staking, mining, amount);
        Ok(())
    }

    /// The pool owner asks to stop being a candidate.
    pub fn remove_my_pool(&mut self, staking: Address, env: &LedgerEnv<'_>) -> Result<(), StakingError> {
        self.non_reentrant(|ledger| {
            let p = ledger.usable_pool(&staking, env)?;
            if p.status != PoolStatus::Active {
                return Err(StakingError::PoolNotActive(staking));
            }
            let status = if env.validators.is_validator_or_pending(&p.mining) {
                PoolStatus::ToBeRemoved
            } else {
                PoolStatus::Inactive
            };
            if let Some(p) = ledger.pools.get_mut(&staking) {
                p.status = status;
            }
            ledger.refresh_likelihood(&staking, env.scores);
            let epoch = ledger.clock.staking_epoch;
            ledger.events.push(LedgerEvent::RemovedPool { staking, epoch });
            info!("Pool {} removed by its owner ({:?})", staking, status);
            Ok(())
        })
    }

    pub fn stake(
        &mut self,
        pool: Address,
        staker: Address,
        amount: Amount,
        env: &LedgerEnv<'_>,
    ) -> Result<(), StakingError> {
        self.non_reentrant(|ledger| {
            ledger.validate_stake(&pool, &staker, amount, env)?;
            ledger.credit(pool, staker, amount)?;
            if staker == pool {
                if let Some(p) = ledger.pools.get_mut(&pool) {
                    if p.status == PoolStatus::Inactive {
                        p.status = PoolStatus::Active;
                        info!("Pool {} reactivated", pool);
                    }
                }
            }
            ledger.refresh_likelihood(&pool, env.scores);

            let epoch = ledger.clock.staking_epoch;
            ledger.events.push(LedgerEvent::PlacedStake { pool, staker, epoch, amount });
            info!("{} staked {} into pool {} in epoch {}", staker, amount, pool, epoch);
            Ok(())
        })
    }

    pub fn withdraw(
        &mut self,
        pool: Address,
        staker: Address,
        amount: Amount,
        env: &LedgerEnv<'_>,
    ) -> Result<Amount, StakingError> {
        self.non_reentrant(|ledger| {
            ledger.validate_withdraw(&pool, &staker, amount, env)?;
            ledger.debit(pool, staker, amount)?;
            ledger.after_debit(pool, staker, env)?;

            let epoch = ledger.clock.staking_epoch;
            ledger.events.push(LedgerEvent::WithdrewStake { pool, staker, epoch, amount });
            info!("{} withdrew {} from pool {} in epoch {}", staker, amount, pool, epoch);
            Ok(amount)
        })
    }

    /// Schedule a withdrawal claimable once the current epoch has ended.
    pub fn order_withdraw(
        &mut self,
        pool: Address,
        staker: Address,
        amount: Amount,
        env: &LedgerEnv<'_>,
    ) -> Result<(), StakingError> {
        self.non_reentrant(|ledger| {
            if amount == 0 {
                return Err(StakingError::ZeroAmount);
            }
            ledger.usable_pool(&pool, env)?;
            let allowed = ledger.max_withdraw_order_allowed(&pool, &staker, env);
            if amount > allowed {
                return Err(StakingError::OrderExceedsAllowed { requested: amount, allowed });
            }
            ledger.check_minimum(&pool, &staker, ledger.stake_amount(&pool, &staker) - amount)?;

            let epoch = ledger.clock.staking_epoch;
            ledger.debit(pool, staker, amount)?;
            if let Some(position) = ledger.positions.get_mut(&pool).and_then(|m| m.get_mut(&staker)) {
                position.ordered_amount = position.ordered_amount.saturating_add(amount);
                position.ordered_epoch = epoch;
            }
            if let Some(p) = ledger.pools.get_mut(&pool) {
                if staker != pool {
                    p.delegators.insert(staker);
                }
            }
            ledger.after_debit(pool, staker, env)?;

            ledger.events.push(LedgerEvent::OrderedWithdrawal { pool, staker, epoch, amount });
            info!("{} ordered withdrawal of {} from pool {} in epoch {}", staker, amount, pool, epoch);
            Ok(())
        })
    }

    /// Put part of an ordered withdrawal back into the live stake.
    pub fn cancel_ordered_withdraw(
        &mut self,
        pool: Address,
        staker: Address,
        amount: Amount,
        env: &LedgerEnv<'_>,
    ) -> Result<(), StakingError> {
        self.non_reentrant(|ledger| {
            if amount == 0 {
                return Err(StakingError::ZeroAmount);
            }
            let p = ledger.usable_pool(&pool, env)?;
            let pool_active = p.is_active();
            let ordered = ledger.ordered_withdraw_amount(&pool, &staker);
            if amount > ordered {
                return Err(StakingError::CancelExceedsOrdered { requested: amount, ordered });
            }
            let new_amount = ledger.stake_amount(&pool, &staker).saturating_add(amount);
            if staker != pool {
                if ledger.stake_amount(&pool, &pool) == 0 {
                    return Err(StakingError::EmptyPool(pool));
                }
                if !pool_active {
                    return Err(StakingError::PoolNotActive(pool));
                }
            }
            ledger.check_minimum(&pool, &staker, new_amount)?;

            if let Some(position) = ledger.positions.get_mut(&pool).and_then(|m| m.get_mut(&staker)) {
                position.ordered_amount -= amount;
            }
            ledger.credit(pool, staker, amount)?;
            ledger.refresh_likelihood(&pool, env.scores);

            let epoch = ledger.clock.staking_epoch;
            ledger.events.push(LedgerEvent::CancelledOrder { pool, staker, epoch, amount });
            info!("{} cancelled {} of its ordered withdrawal from pool {}", staker, amount, pool);
            Ok(())
        })
    }

    /// Pay out a matured ordered withdrawal. Returns the amount released.
    pub fn claim_ordered_withdraw(
        &mut self,
        pool: Address,
        staker: Address,
        env: &LedgerEnv<'_>,
    ) -> Result<Amount, StakingError> {
        self.non_reentrant(|ledger| {
            ledger.usable_pool(&pool, env)?;
            let position = ledger.position(&pool, &staker).ok_or(StakingError::NothingOrdered)?;
            let amount = position.ordered_amount;
            if amount == 0 {
                return Err(StakingError::NothingOrdered);
            }
            let epoch = ledger.clock.staking_epoch;
            if epoch <= position.ordered_epoch {
                return Err(StakingError::OrderNotMatured { ordered_epoch: position.ordered_epoch });
            }
            ledger.require_window(env)?;

            let mut emptied = false;
            if let Some(position) = ledger.positions.get_mut(&pool).and_then(|m| m.get_mut(&staker)) {
                position.ordered_amount = 0;
                emptied = position.is_empty();
            }
            if emptied && staker != pool {
                if let Some(p) = ledger.pools.get_mut(&pool) {
                    p.delegators.remove(&staker);
                }
            }

            ledger.events.push(LedgerEvent::ClaimedOrderedWithdrawal { pool, staker, epoch, amount });
            info!("{} claimed ordered withdrawal of {} from pool {}", staker, amount, pool);
            Ok(amount)
        })
    }

    /// Withdraw from one pool and stake into another in a single step.
    pub fn move_stake(
        &mut self,
        from: Address,
        to: Address,
        staker: Address,
        amount: Amount,
        env: &LedgerEnv<'_>,
    ) -> Result<(), StakingError> {
        self.non_reentrant(|ledger| {
            if from == to {
                return Err(StakingError::SamePool);
            }
            ledger.validate_withdraw(&from, &staker, amount, env)?;
            ledger.validate_stake(&to, &staker, amount, env)?;

            ledger.debit(from, staker, amount)?;
            ledger.after_debit(from, staker, env)?;
            ledger.credit(to, staker, amount)?;
            ledger.refresh_likelihood(&to, env.scores);

            let epoch = ledger.clock.staking_epoch;
            ledger.events.push(LedgerEvent::MovedStake { from, to, staker, epoch, amount });
            info!("{} moved {} from pool {} to pool {}", staker, amount, from, to);
            Ok(())
        })
    }

    /// Reward a staker earned in `pool` for the given finished epochs.
    ///
    /// With an empty list the ledger walks forward from the staker's claim
    /// cursor up to (not including) the current epoch and settles everything
    /// on the way. Already claimed epochs pay zero.
    pub fn claim_reward(
        &mut self,
        epochs: &[EpochNumber],
        pool: Address,
        staker: Address,
        env: &LedgerEnv<'_>,
    ) -> Result<Amount, StakingError> {
        self.non_reentrant(|ledger| {
            ledger.usable_pool(&pool, env)?;
            let current = ledger.clock.staking_epoch;
            let position = ledger.position(&pool, &staker).ok_or(StakingError::NoStake { pool, staker })?;

            let walk = epochs.is_empty();
            let targets: Vec<EpochNumber> = if walk {
                ledger.unclaimed_reward_epochs(&pool, position, current)
            } else {
                let unique: BTreeSet<EpochNumber> = epochs.iter().copied().collect();
                if let Some(epoch) = unique.iter().find(|e| **e >= current) {
                    return Err(StakingError::EpochNotFinished { epoch: *epoch, current });
                }
                unique.into_iter().filter(|e| !position.is_claimed(*e)).collect()
            };

            let mut payout = 0u128;
            for epoch in &targets {
                let Some(record) = ledger.epoch_pool_reward(&pool, *epoch) else { continue };
                let share = if staker == pool {
                    record.validator_share()
                } else {
                    record.delegator_share(position.amount_at(*epoch))
                };
                payout = payout.checked_add(share).ok_or(StakingError::ArithmeticOverflow)?;
            }
            if payout > ledger.reward_reserve {
                return Err(StakingError::RewardReserveExhausted { reserve: ledger.reward_reserve, payout });
            }

            if let Some(position) = ledger.positions.get_mut(&pool).and_then(|m| m.get_mut(&staker)) {
                if walk {
                    position.settle_until(current);
                } else {
                    let cursor = position.claim_cursor;
                    position.claimed.extend(targets.iter().copied().filter(|e| *e >= cursor));
                }
            }
            ledger.reward_reserve -= payout;

            debug!("{} settled {} reward epochs in pool {}", staker, targets.len(), pool);
            if payout > 0 {
                info!("{} claimed {} reward from pool {}", staker, payout, pool);
            }
            ledger.events.push(LedgerEvent::ClaimedReward { pool, staker, epochs: targets, amount: payout });
            Ok(payout)
        })
    }

    /// Rewarded epochs in `[max(cursor, first stake), current)` not yet claimed.
    fn unclaimed_reward_epochs(
        &self,
        pool: &Address,
        position: &StakePosition,
        current: EpochNumber,
    ) -> Vec<EpochNumber> {
        let Some(first) = position.first_staked_epoch() else { return Vec::new() };
        let Some(p) = self.pools.get(pool) else { return Vec::new() };
        let (pool_first, _) = p.staked_range(current);
        let start = position.claim_cursor.max(first).max(pool_first);
        if start >= current {
            return Vec::new();
        }
        match self.pool_rewards.get(pool) {
            Some(rewards) => rewards
                .range(start..current)
                .map(|(epoch, _)| *epoch)
                .filter(|epoch| !position.is_claimed(*epoch))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Sum of what a staker could claim now without changing state.
    pub fn pending_reward(&self, pool: &Address, staker: &Address) -> Amount {
        let Some(position) = self.position(pool, staker) else { return 0 };
        let current = self.clock.staking_epoch;
        self.unclaimed_reward_epochs(pool, position, current)
            .into_iter()
            .filter_map(|epoch| self.epoch_pool_reward(pool, epoch))
            .map(|record| {
                if staker == pool {
                    record.validator_share()
                } else {
                    record.delegator_share(position.amount_at(record.epoch))
                }
            })
            .fold(0u128, |acc, share| acc.saturating_add(share))
    }

    // ---------------------------------------------------------------------
    // Component calls
    // ---------------------------------------------------------------------

    /// Advance the staking epoch. Validator set only.
    pub fn begin_epoch(
        &mut self,
        caller: Address,
        start_time: Timestamp,
        start_block: u64,
    ) -> Result<EpochNumber, StakingError> {
        Self::require_caller(caller, component::VALIDATOR_SET)?;
        self.clock.begin_next_epoch(start_time, start_block);
        info!("Staking epoch {} started at {} (block {})", self.clock.staking_epoch, start_time, start_block);
        Ok(self.clock.staking_epoch)
    }

    /// Record the stake distribution of the pools validating `epoch`.
    pub fn snapshot_pool_stakes(
        &mut self,
        caller: Address,
        epoch: EpochNumber,
        pools: &[Address],
    ) -> Result<(), StakingError> {
        Self::require_caller(caller, component::VALIDATOR_SET)?;
        if epoch != self.clock.staking_epoch {
            return Err(StakingError::SnapshotEpochMismatch { requested: epoch, current: self.clock.staking_epoch });
        }
        for pool in pools {
            if !self.pools.contains_key(pool) {
                return Err(StakingError::PoolNotFound(*pool));
            }
        }
        for pool in pools {
            let stakers = self.positions.get(pool);
            let total_stake = stakers
                .map(|m| m.values().fold(0u128, |acc, p| acc.saturating_add(p.amount_at(epoch))))
                .unwrap_or(0);
            let validator_stake = stakers.and_then(|m| m.get(pool)).map(|p| p.amount_at(epoch)).unwrap_or(0);
            self.snapshots
                .entry(*pool)
                .or_default()
                .insert(epoch, PoolSnapshot { total_stake, validator_stake });
            debug!("Snapshot pool {} epoch {}: total {} validator {}", pool, epoch, total_stake, validator_stake);
        }
        Ok(())
    }

    /// Book a pool's reward for a finished epoch. Block reward only.
    pub fn record_epoch_reward(
        &mut self,
        caller: Address,
        epoch: EpochNumber,
        pool: Address,
        reward: Amount,
        validator_min_reward_percent: u64,
    ) -> Result<(), StakingError> {
        Self::require_caller(caller, component::BLOCK_REWARD)?;
        if self.epoch_pool_reward(&pool, epoch).is_some() {
            return Err(StakingError::EpochAlreadyRewarded { pool, epoch });
        }
        let snapshot = self.snapshot(&pool, epoch).ok_or(StakingError::MissingSnapshot { pool, epoch })?;
        let reserve = self.reward_reserve.checked_add(reward).ok_or(StakingError::ArithmeticOverflow)?;

        if let Some(per_pool) = self.snapshots.get_mut(&pool) {
            per_pool.remove(&epoch);
        }
        self.pool_rewards.entry(pool).or_default().insert(
            epoch,
            EpochPoolReward { epoch, reward, snapshot, validator_min_reward_percent },
        );
        self.reward_reserve = reserve;
        self.events.push(LedgerEvent::EpochRewardRecorded { pool, epoch, amount: reward });
        debug!("Pool {} booked {} for epoch {}", pool, reward, epoch);
        Ok(())
    }

    /// Turn pools scheduled for removal inactive once they left the validator set.
    pub fn finalize_pool_removals(
        &mut self,
        caller: Address,
        validators: &dyn ValidatorStatus,
    ) -> Result<Vec<Address>, StakingError> {
        Self::require_caller(caller, component::VALIDATOR_SET)?;
        let mut removed = Vec::new();
        for p in self.pools.values_mut() {
            if p.status == PoolStatus::ToBeRemoved && !validators.is_validator_or_pending(&p.mining) {
                p.status = PoolStatus::Inactive;
                p.likelihood = 0;
                removed.push(p.staking);
            }
        }
        for pool in &removed {
            info!("Pool {} is now inactive", pool);
        }
        Ok(removed)
    }

    /// Take an evicted pool out of the election. Validator set only.
    pub fn deactivate_pool(
        &mut self,
        caller: Address,
        mining: &Address,
        validators: &dyn ValidatorStatus,
    ) -> Result<(), StakingError> {
        Self::require_caller(caller, component::VALIDATOR_SET)?;
        let staking = self.staking_by_mining(mining).ok_or(StakingError::PoolNotFound(*mining))?;
        if let Some(p) = self.pools.get_mut(&staking) {
            if p.status == PoolStatus::Active {
                p.status = if validators.is_validator_or_pending(mining) {
                    PoolStatus::ToBeRemoved
                } else {
                    PoolStatus::Inactive
                };
            }
            p.likelihood = 0;
        }
        warn!("Pool {} (mining {}) deactivated", staking, mining);
        Ok(())
    }

    /// Recompute a pool's likelihood after its bonus score changed. Bonus score only.
    pub fn update_likelihood(&mut self, caller: Address, mining: &Address, score: u64) -> Result<(), StakingError> {
        Self::require_caller(caller, component::BONUS_SCORE)?;
        let Some(staking) = self.staking_by_mining(mining) else {
            return Ok(());
        };
        if let Some(p) = self.pools.get_mut(&staking) {
            p.likelihood = if p.is_active() { p.total_stake.saturating_mul(score as u128) } else { 0 };
        }
        Ok(())
    }

    /// Re-check the stake bookkeeping invariants over the whole ledger.
    pub fn verify_invariants(&self) -> Result<(), StakingError> {
        for (staking, pool) in &self.pools {
            let stakers = self.positions.get(staking);
            let sum = stakers
                .map(|m| m.values().fold(0u128, |acc, p| acc.saturating_add(p.amount)))
                .unwrap_or(0);
            if sum != pool.total_stake {
                return Err(StakingError::InvariantViolation(format!(
                    "pool {} total {} != positions {}",
                    staking, pool.total_stake, sum
                )));
            }
            if self.stake_amount(staking, staking) == 0 && sum != 0 {
                return Err(StakingError::InvariantViolation(format!(
                    "empty pool {} holds {} delegated stake",
                    staking, sum
                )));
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Parameters
    // ---------------------------------------------------------------------

    pub fn set_param(&mut self, caller: Address, key: &str, value: ParamValue) -> Result<ParamChange, StakingError> {
        Self::require_caller(caller, self.owner)?;
        let registry = StakingParams::registry()?;
        Ok(registry.set(&mut self.params, key, value)?)
    }

    pub fn is_allowed_change(&self, key: &str, value: ParamValue) -> bool {
        StakingParams::registry()
            .map(|r| r.is_allowed_change(&self.params, key, value))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use posdao_core::{EpochSettings, FlatScore, NoValidators};

    const OWNER: Address = Address([0xaa; 20]);

    struct Status {
        validators: Vec<Address>,
        banned: Vec<Address>,
    }

    impl ValidatorStatus for Status {
        fn is_validator_or_pending(&self, mining: &Address) -> bool {
            self.validators.contains(mining)
        }
        fn is_banned(&self, mining: &Address, _now: Timestamp) -> bool {
            self.banned.contains(mining)
        }
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64(n)
    }

    fn mining(n: u64) -> Address {
        Address::from_low_u64(1000 + n)
    }

    fn ledger() -> StakeLedger {
        let settings = EpochSettings::new(1000, 200, 100).unwrap();
        let params = StakingParams { candidate_min_stake: 100, delegator_min_stake: 10 };
        StakeLedger::new(params, OWNER, EpochClock::genesis(settings, 0, 0)).unwrap()
    }

    static UNIT_SCORE: FlatScore = FlatScore(1);

    fn env<'a>(now: Timestamp, status: &'a dyn ValidatorStatus) -> LedgerEnv<'a> {
        LedgerEnv::new(now, status, &UNIT_SCORE)
    }

    fn next_epoch(l: &mut StakeLedger) {
        let start = l.clock().end_time();
        l.begin_epoch(component::VALIDATOR_SET, start, 0).unwrap();
    }

    #[test]
    fn test_add_pool_and_stake() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();
        l.stake(addr(1), addr(2), 50, &e).unwrap();

        assert_eq!(l.stake_amount_total(&addr(1)), 150);
        assert_eq!(l.pools(), vec![addr(1)]);
        assert_eq!(l.delegators(&addr(1)), vec![addr(2)]);
        assert_eq!(l.pool(&addr(1)).unwrap().likelihood, 150);
        assert_eq!(l.staking_by_mining(&mining(1)), Some(addr(1)));
        assert_eq!(l.take_events().len(), 2);
    }

    #[test]
    fn test_add_pool_rejections() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        assert_eq!(
            l.add_pool(addr(1), mining(1), 99, &e),
            Err(StakingError::BelowCandidateMinimum { amount: 99, minimum: 100 })
        );
        assert_eq!(l.add_pool(addr(1), addr(1), 100, &e), Err(StakingError::SameStakingAndMining));
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();
        assert_eq!(l.add_pool(addr(1), mining(2), 100, &e), Err(StakingError::PoolAlreadyExists(addr(1))));
        assert_eq!(l.add_pool(addr(2), mining(1), 100, &e), Err(StakingError::MiningAddressInUse(mining(1))));
    }

    #[test]
    fn test_stake_rejections() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();

        assert_eq!(l.stake(addr(1), addr(2), 0, &e), Err(StakingError::ZeroAmount));
        assert_eq!(l.stake(addr(9), addr(2), 50, &e), Err(StakingError::PoolNotFound(addr(9))));
        assert_eq!(
            l.stake(addr(1), addr(2), 5, &e),
            Err(StakingError::BelowDelegatorMinimum { amount: 5, minimum: 10 })
        );
        let late = env(950, &NoValidators);
        assert_eq!(l.stake(addr(1), addr(2), 50, &late), Err(StakingError::StakingWindowClosed { now: 950 }));

        let banned = Status { validators: vec![], banned: vec![mining(1)] };
        assert_eq!(l.stake(addr(1), addr(2), 50, &env(10, &banned)), Err(StakingError::PoolBanned(addr(1))));
    }

    #[test]
    fn test_validator_pool_withdraw_limited_to_fresh_stake() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();
        l.stake(addr(1), addr(2), 50, &e).unwrap();
        next_epoch(&mut l);

        let status = Status { validators: vec![mining(1)], banned: vec![] };
        let ve = env(1010, &status);
        l.stake(addr(1), addr(2), 20, &ve).unwrap();
        assert_eq!(l.max_withdraw_allowed(&addr(1), &addr(2), &ve), 20);
        assert_eq!(l.max_withdraw_order_allowed(&addr(1), &addr(2), &ve), 50);
        assert_eq!(
            l.withdraw(addr(1), addr(2), 30, &ve),
            Err(StakingError::WithdrawExceedsAllowed { requested: 30, allowed: 20 })
        );
        assert_eq!(l.withdraw(addr(1), addr(2), 20, &ve), Ok(20));
        assert_eq!(l.stake_amount(&addr(1), &addr(2)), 50);
    }

    #[test]
    fn test_withdraw_residual_must_respect_minimum() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 150, &e).unwrap();
        assert_eq!(
            l.withdraw(addr(1), addr(1), 60, &e),
            Err(StakingError::BelowCandidateMinimum { amount: 90, minimum: 100 })
        );
        assert_eq!(l.withdraw(addr(1), addr(1), 50, &e), Ok(50));
    }

    #[test]
    fn test_empty_pool_unbonds_delegators() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();
        l.stake(addr(1), addr(2), 50, &e).unwrap();
        l.take_events();

        l.withdraw(addr(1), addr(1), 100, &e).unwrap();
        let p = l.pool(&addr(1)).unwrap();
        assert_eq!(p.status, PoolStatus::Inactive);
        assert_eq!(p.total_stake, 0);
        assert_eq!(p.likelihood, 0);
        assert_eq!(l.stake_amount(&addr(1), &addr(2)), 0);
        assert_eq!(l.ordered_withdraw_amount(&addr(1), &addr(2)), 50);
        assert!(l.take_events().iter().any(|ev| matches!(ev, LedgerEvent::DelegatorUnbonded { amount: 50, .. })));

        // nobody can delegate into the empty pool
        assert_eq!(l.stake(addr(1), addr(3), 50, &e), Err(StakingError::EmptyPool(addr(1))));

        next_epoch(&mut l);
        assert_eq!(l.claim_ordered_withdraw(addr(1), addr(2), &env(1010, &NoValidators)), Ok(50));
        assert!(l.delegators(&addr(1)).is_empty());
    }

    #[test]
    fn test_order_withdraw_matures_next_epoch() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();
        l.stake(addr(1), addr(2), 50, &e).unwrap();

        // ordering works inside the disallow window
        let late = env(950, &NoValidators);
        l.order_withdraw(addr(1), addr(2), 30, &late).unwrap();
        assert_eq!(l.stake_amount(&addr(1), &addr(2)), 20);
        assert_eq!(
            l.claim_ordered_withdraw(addr(1), addr(2), &late),
            Err(StakingError::OrderNotMatured { ordered_epoch: 0 })
        );

        l.cancel_ordered_withdraw(addr(1), addr(2), 10, &late).unwrap();
        assert_eq!(l.ordered_withdraw_amount(&addr(1), &addr(2)), 20);
        assert_eq!(l.stake_amount(&addr(1), &addr(2)), 30);

        next_epoch(&mut l);
        let e1 = env(1010, &NoValidators);
        assert_eq!(l.claim_ordered_withdraw(addr(1), addr(2), &e1), Ok(20));
        assert_eq!(l.claim_ordered_withdraw(addr(1), addr(2), &e1), Err(StakingError::NothingOrdered));
    }

    #[test]
    fn test_move_stake() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();
        l.add_pool(addr(3), mining(3), 100, &e).unwrap();
        l.stake(addr(1), addr(2), 50, &e).unwrap();

        assert_eq!(l.move_stake(addr(1), addr(1), addr(2), 10, &e), Err(StakingError::SamePool));
        l.move_stake(addr(1), addr(3), addr(2), 50, &e).unwrap();
        assert_eq!(l.stake_amount(&addr(1), &addr(2)), 0);
        assert_eq!(l.stake_amount(&addr(3), &addr(2)), 50);
        assert_eq!(l.stake_amount_total(&addr(1)), 100);
        assert_eq!(l.stake_amount_total(&addr(3)), 150);
    }

    #[test]
    fn test_remove_my_pool_while_validator() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();

        let status = Status { validators: vec![mining(1)], banned: vec![] };
        l.remove_my_pool(addr(1), &env(10, &status)).unwrap();
        assert_eq!(l.pools_to_be_removed(), vec![addr(1)]);
        assert!(l.pools_to_be_elected().is_empty());

        let removed = l.finalize_pool_removals(component::VALIDATOR_SET, &NoValidators).unwrap();
        assert_eq!(removed, vec![addr(1)]);
        assert_eq!(l.pools_inactive(), vec![addr(1)]);
    }

    #[test]
    fn test_snapshot_and_reward_claim() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();
        l.stake(addr(1), addr(2), 50, &e).unwrap();
        next_epoch(&mut l);

        l.snapshot_pool_stakes(component::VALIDATOR_SET, 1, &[addr(1)]).unwrap();
        assert_eq!(l.snapshot(&addr(1), 1), Some(PoolSnapshot { total_stake: 150, validator_stake: 100 }));
        l.record_epoch_reward(component::BLOCK_REWARD, 1, addr(1), 1000, 30).unwrap();
        assert_eq!(
            l.record_epoch_reward(component::BLOCK_REWARD, 1, addr(1), 1000, 30),
            Err(StakingError::EpochAlreadyRewarded { pool: addr(1), epoch: 1 })
        );
        next_epoch(&mut l);

        let e2 = env(2010, &NoValidators);
        assert_eq!(l.pending_reward(&addr(1), &addr(1)), 766);
        assert_eq!(l.claim_reward(&[], addr(1), addr(1), &e2), Ok(766));
        assert_eq!(l.claim_reward(&[1], addr(1), addr(2), &e2), Ok(233));
        assert_eq!(l.claim_reward(&[1], addr(1), addr(2), &e2), Ok(0));
        assert_eq!(l.claim_reward(&[], addr(1), addr(1), &e2), Ok(0));
        assert_eq!(l.reward_reserve(), 1);
    }

    #[test]
    fn test_claim_rejects_unfinished_epoch() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();
        assert_eq!(
            l.claim_reward(&[0], addr(1), addr(1), &e),
            Err(StakingError::EpochNotFinished { epoch: 0, current: 0 })
        );
    }

    #[test]
    fn test_missing_snapshot_is_an_error() {
        let mut l = ledger();
        let e = env(10, &NoValidators);
        l.add_pool(addr(1), mining(1), 100, &e).unwrap();
        assert_eq!(
            l.record_epoch_reward(component::BLOCK_REWARD, 0, addr(1), 10, 30),
            Err(StakingError::MissingSnapshot { pool: addr(1), epoch: 0 })
        );
    }

    #[test]
    fn test_component_calls_are_authorized() {
        let mut l = ledger();
        assert_eq!(l.begin_epoch(OWNER, 1, 1), Err(StakingError::Unauthorized(OWNER)));
        assert_eq!(
            l.record_epoch_reward(component::VALIDATOR_SET, 0, addr(1), 1, 30),
            Err(StakingError::Unauthorized(component::VALIDATOR_SET))
        );
        assert_eq!(
            l.update_likelihood(component::BLOCK_REWARD, &mining(1), 5),
            Err(StakingError::Unauthorized(component::BLOCK_REWARD))
        );
    }

    #[test]
    fn test_min_stake_params_step_one_rung() {
        let mut l = ledger();
        assert!(l.is_allowed_change(StakingParams::CANDIDATE_MIN_STAKE, 200));
        assert!(!l.is_allowed_change(StakingParams::CANDIDATE_MIN_STAKE, 1000));
        assert!(matches!(
            l.set_param(addr(5), StakingParams::CANDIDATE_MIN_STAKE, 200),
            Err(StakingError::Unauthorized(_))
        ));
        l.set_param(OWNER, StakingParams::CANDIDATE_MIN_STAKE, 200).unwrap();
        assert_eq!(l.params().candidate_min_stake, 200);
    }
}
