// REWARD POTS & DISTRIBUTION ENGINE
// Drains the delta and reinsert pots at every epoch end and books each validator pool's share.
//
// SAFETY INVARIANTS:
// 1. Only the system address can trigger distribution
// 2. drained + carried_in == governance + booked pool rewards + carried_out (nothing is lost)
// 3. Epoch percentage is capped at 100; the unpaid part of a short epoch is carried, never burned
// 4. Banned validators get nothing and their share is not given to anyone else
// 5. An empty validator list at an epoch end is fatal, never skipped

use crate::stake_ledger::{StakeLedger, StakingError};
use log::{debug, error, info, warn};
use posdao_core::{
    component, mul_div, percent_of, stepped_table, Address, Amount, BoundedParams, EpochNumber, Guarded,
    NonReentrant, ParamChange, ParamError, ParamValue, ReentrancyError, Timestamp, ValidatorStatus,
    SYSTEM_ADDRESS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewardError {
    #[error("caller {0} is not authorized")]
    Unauthorized(Address),

    #[error("amount must be > 0")]
    ZeroAmount,

    #[error("validator list is empty at epoch end")]
    EmptyValidatorSet,

    #[error("target epoch duration must be > 0")]
    ZeroEpochDuration,

    #[error("max validators must be > 0")]
    ZeroMaxValidators,

    #[error("validator {0} has no pool")]
    UnknownValidator(Address),

    #[error("epoch {0} already rewarded")]
    EpochAlreadyRewarded(EpochNumber),

    #[error("pot overflow")]
    ArithmeticOverflow,

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Staking(#[from] StakingError),

    #[error(transparent)]
    Reentrancy(#[from] ReentrancyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardParams {
    /// Receives the governance share. Zero disables the share.
    pub governance_address: Address,

    /// Percent of each epoch's distributable amount routed to governance
    pub governance_pot_share_percent: u64,

    /// Percent of the delta pot drained per epoch with a full committee
    pub delta_pot_payout_percent: u64,

    /// Percent of the reinsert pot drained per epoch with a full committee
    pub reinsert_pot_payout_percent: u64,

    /// Share of a pool's reward reserved for its validator before delegators split the rest
    pub validator_min_reward_percent: u64,

    /// Committee size that drains the full payout percentage
    pub max_validators: u64,
}

impl Default for RewardParams {
    fn default() -> Self {
        RewardParams {
            governance_address: Address::ZERO,
            governance_pot_share_percent: 10,
            delta_pot_payout_percent: 10,
            reinsert_pot_payout_percent: 10,
            validator_min_reward_percent: 30,
            max_validators: 25,
        }
    }
}

impl RewardParams {
    pub const GOVERNANCE_POT_SHARE_PERCENT: &'static str = "governance_pot_share_percent";
    pub const DELTA_POT_PAYOUT_PERCENT: &'static str = "delta_pot_payout_percent";
    pub const REINSERT_POT_PAYOUT_PERCENT: &'static str = "reinsert_pot_payout_percent";
    pub const VALIDATOR_MIN_REWARD_PERCENT: &'static str = "validator_min_reward_percent";

    pub fn registry() -> Result<BoundedParams<RewardParams>, ParamError> {
        BoundedParams::<RewardParams>::new()
            .register(
                Self::GOVERNANCE_POT_SHARE_PERCENT,
                |p| p.governance_pot_share_percent as ParamValue,
                |p, v| p.governance_pot_share_percent = v as u64,
                stepped_table(0, 20, 2),
            )?
            .register(
                Self::DELTA_POT_PAYOUT_PERCENT,
                |p| p.delta_pot_payout_percent as ParamValue,
                |p, v| p.delta_pot_payout_percent = v as u64,
                stepped_table(1, 100, 1),
            )?
            .register(
                Self::REINSERT_POT_PAYOUT_PERCENT,
                |p| p.reinsert_pot_payout_percent as ParamValue,
                |p, v| p.reinsert_pot_payout_percent = v as u64,
                stepped_table(1, 100, 1),
            )?
            .register(
                Self::VALIDATOR_MIN_REWARD_PERCENT,
                |p| p.validator_min_reward_percent as ParamValue,
                |p, v| p.validator_min_reward_percent = v as u64,
                stepped_table(0, 100, 5),
            )
    }

    pub fn validate(&self) -> Result<(), RewardError> {
        if self.max_validators == 0 {
            return Err(RewardError::ZeroMaxValidators);
        }
        Self::registry()?.verify(self)?;
        Ok(())
    }
}

/// The three reward balances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPots {
    pub delta: Amount,
    pub reinsert: Amount,
    /// Carry-over from short epochs, banned validators and rounding
    pub undistributed: Amount,
}

impl RewardPots {
    pub fn total(&self) -> Amount {
        self.delta.saturating_add(self.reinsert).saturating_add(self.undistributed)
    }
}

/// Everything the engine knows about the epoch being closed.
#[derive(Debug, Clone)]
pub struct EpochRewardInput {
    pub epoch: EpochNumber,
    pub epoch_start: Timestamp,
    pub target_duration: u64,
    pub now: Timestamp,
    /// Mining addresses of the current validators
    pub validators: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRewardSummary {
    pub epoch: EpochNumber,
    pub epoch_percentage: u64,
    pub delta_drained: Amount,
    pub reinsert_drained: Amount,
    pub carried_in: Amount,
    pub distributable: Amount,
    pub governance_share: Amount,
    pub per_validator: Amount,
    /// Staking addresses that were booked a reward
    pub rewarded_pools: Vec<Address>,
    /// Mining addresses skipped because they were banned
    pub banned: Vec<Address>,
    pub carried_out: Amount,
    pub minted: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardEngine {
    params: RewardParams,
    owner: Address,
    pots: RewardPots,
    early_epoch_end: bool,
    total_minted: Amount,
    governance_paid: Amount,
    summaries: BTreeMap<EpochNumber, EpochRewardSummary>,

    #[serde(skip)]
    guard: NonReentrant,
}

impl Guarded for RewardEngine {
    const COMPONENT: &'static str = "block reward";

    fn guard_mut(&mut self) -> &mut NonReentrant {
        &mut self.guard
    }
}

impl RewardEngine {
    pub fn new(params: RewardParams, owner: Address) -> Result<Self, RewardError> {
        params.validate()?;
        Ok(RewardEngine {
            params,
            owner,
            pots: RewardPots::default(),
            early_epoch_end: false,
            total_minted: 0,
            governance_paid: 0,
            summaries: BTreeMap::new(),
            guard: NonReentrant::default(),
        })
    }

    pub fn params(&self) -> &RewardParams {
        &self.params
    }

    pub fn pots(&self) -> RewardPots {
        self.pots
    }

    pub fn total_minted(&self) -> Amount {
        self.total_minted
    }

    pub fn governance_paid(&self) -> Amount {
        self.governance_paid
    }

    pub fn is_early_epoch_end(&self) -> bool {
        self.early_epoch_end
    }

    pub fn epoch_reward_summary(&self, epoch: EpochNumber) -> Option<&EpochRewardSummary> {
        self.summaries.get(&epoch)
    }

    fn require_caller(caller: Address, expected: Address) -> Result<(), RewardError> {
        if caller != expected {
            warn!("Unauthorized block reward call from {}", caller);
            return Err(RewardError::Unauthorized(caller));
        }
        Ok(())
    }

    pub fn add_to_delta_pot(&mut self, amount: Amount) -> Result<(), RewardError> {
        if amount == 0 {
            return Err(RewardError::ZeroAmount);
        }
        self.pots.delta = self.pots.delta.checked_add(amount).ok_or(RewardError::ArithmeticOverflow)?;
        info!("Delta pot funded with {} (now {})", amount, self.pots.delta);
        Ok(())
    }

    pub fn add_to_reinsert_pot(&mut self, amount: Amount) -> Result<(), RewardError> {
        if amount == 0 {
            return Err(RewardError::ZeroAmount);
        }
        self.pots.reinsert = self.pots.reinsert.checked_add(amount).ok_or(RewardError::ArithmeticOverflow)?;
        info!("Reinsert pot funded with {} (now {})", amount, self.pots.reinsert);
        Ok(())
    }

    /// Mark the running epoch to be closed at the next block.
    pub fn notify_early_epoch_end(&mut self, caller: Address) -> Result<(), RewardError> {
        Self::require_caller(caller, component::CONNECTIVITY_TRACKER)?;
        if !self.early_epoch_end {
            warn!("Early epoch end requested by the connectivity tracker");
        }
        self.early_epoch_end = true;
        Ok(())
    }

    /// Percentage of the target duration the epoch actually ran, capped at 100.
    pub fn epoch_percentage(input: &EpochRewardInput) -> u64 {
        if input.target_duration == 0 {
            return 100;
        }
        let elapsed = input.now.saturating_sub(input.epoch_start) as u128;
        (elapsed * 100 / input.target_duration as u128).min(100) as u64
    }

    fn pot_drain(&self, pot: Amount, percent: u64, validators: u64) -> Amount {
        let n = validators.min(self.params.max_validators) as u128;
        let denom = self.params.max_validators as u128 * 100;
        mul_div(pot, percent as u128 * n, denom).unwrap_or(0)
    }

    /// Per-block entry point. Distributes only on the epoch end block and
    /// returns the amount minted.
    pub fn reward(
        &mut self,
        caller: Address,
        is_epoch_end: bool,
        input: &EpochRewardInput,
        ledger: &mut StakeLedger,
        status: &dyn ValidatorStatus,
    ) -> Result<Amount, RewardError> {
        self.non_reentrant(|engine| {
            Self::require_caller(caller, SYSTEM_ADDRESS)?;
            if !is_epoch_end {
                return Ok(0);
            }
            engine.distribute(input, ledger, status)
        })
    }

    fn distribute(
        &mut self,
        input: &EpochRewardInput,
        ledger: &mut StakeLedger,
        status: &dyn ValidatorStatus,
    ) -> Result<Amount, RewardError> {
        if input.validators.is_empty() {
            error!("Epoch {} ended with an empty validator list", input.epoch);
            return Err(RewardError::EmptyValidatorSet);
        }
        if input.target_duration == 0 {
            return Err(RewardError::ZeroEpochDuration);
        }
        if self.summaries.contains_key(&input.epoch) {
            return Err(RewardError::EpochAlreadyRewarded(input.epoch));
        }

        // resolve pools first so nothing is written for a broken validator list
        let mut eligible = Vec::new();
        let mut banned = Vec::new();
        for mining in &input.validators {
            let staking = ledger.staking_by_mining(mining).ok_or(RewardError::UnknownValidator(*mining))?;
            if status.is_banned(mining, input.now) {
                banned.push(*mining);
            } else {
                eligible.push(staking);
            }
        }

        let n = input.validators.len() as u64;
        let pct = Self::epoch_percentage(input);
        let delta_drained = self.pot_drain(self.pots.delta, self.params.delta_pot_payout_percent, n);
        let reinsert_drained = self.pot_drain(self.pots.reinsert, self.params.reinsert_pot_payout_percent, n);
        let carried_in = self.pots.undistributed;
        let total = delta_drained
            .checked_add(reinsert_drained)
            .and_then(|t| t.checked_add(carried_in))
            .ok_or(RewardError::ArithmeticOverflow)?;

        let distributable = percent_of(total, pct);
        let governance_share = if self.params.governance_address.is_zero() || eligible.is_empty() {
            0
        } else {
            percent_of(distributable, self.params.governance_pot_share_percent)
        };
        let per_validator = (distributable - governance_share) / n as u128;

        let validator_min = self.params.validator_min_reward_percent;
        let mut booked = 0u128;
        if per_validator > 0 {
            for staking in &eligible {
                ledger.record_epoch_reward(component::BLOCK_REWARD, input.epoch, *staking, per_validator, validator_min)?;
                booked += per_validator;
            }
        }

        let minted = governance_share + booked;
        let carried_out = total - minted;

        self.pots.delta -= delta_drained;
        self.pots.reinsert -= reinsert_drained;
        self.pots.undistributed = carried_out;
        self.total_minted = self.total_minted.saturating_add(minted);
        self.governance_paid = self.governance_paid.saturating_add(governance_share);
        self.early_epoch_end = false;

        for mining in &banned {
            warn!("Banned validator {} gets no reward for epoch {}", mining, input.epoch);
        }
        debug!(
            "Epoch {} pots drained: delta {} reinsert {} carried in {}",
            input.epoch, delta_drained, reinsert_drained, carried_in
        );
        info!(
            "Epoch {} rewarded at {}%: {} minted ({} governance, {} x {} pools), {} carried",
            input.epoch,
            pct,
            minted,
            governance_share,
            per_validator,
            eligible.len(),
            carried_out
        );

        self.summaries.insert(
            input.epoch,
            EpochRewardSummary {
                epoch: input.epoch,
                epoch_percentage: pct,
                delta_drained,
                reinsert_drained,
                carried_in,
                distributable,
                governance_share,
                per_validator,
                rewarded_pools: if per_validator > 0 { eligible } else { Vec::new() },
                banned,
                carried_out,
                minted,
            },
        );
        Ok(minted)
    }

    pub fn set_param(&mut self, caller: Address, key: &str, value: ParamValue) -> Result<ParamChange, RewardError> {
        Self::require_caller(caller, self.owner)?;
        Ok(RewardParams::registry()?.set(&mut self.params, key, value)?)
    }

    pub fn set_governance_address(&mut self, caller: Address, governance: Address) -> Result<(), RewardError> {
        Self::require_caller(caller, self.owner)?;
        self.params.governance_address = governance;
        info!("Governance address set to {}", governance);
        Ok(())
    }
}
