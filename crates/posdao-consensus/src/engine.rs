// EPOCH ENGINE
// Per-block driver tying the stake ledger, reward pots, bonus scores,
// validator rotation and connectivity tracker together.
//
// SAFETY INVARIANTS:
// 1. Every externally triggered call is all-or-nothing (state restored on error)
// 2. Only the system address drives blocks; block numbers and time only move forward
// 3. Snapshots for an epoch exist before that epoch's reward call reads them
// 4. Faulty validators are penalised before the epoch reward, once per epoch
// 5. User operations are evaluated at the time of the latest block

use crate::block_history::BlockHistory;
use crate::config::{ConfigError, EngineConfig};
use crate::connectivity::{ConnectivityError, ConnectivityParams, ConnectivityTracker, ReportEnv, ReportOutcome};
use crate::epoch::EpochPhase;
use crate::key_gen::KeyGenHistory;
use crate::validator_set::{FinalizeOutcome, RotationError, ValidatorRotation};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use posdao_core::{
    component, Address, Amount, BlockContext, BlockHash, EpochClock, EpochNumber, ParamChange, ParamError,
    ParamValue, Timestamp, SYSTEM_ADDRESS,
};
use posdao_economics::integration::{EconomicError, EconomicLedgers};
use posdao_economics::{
    BonusScoreError, BonusScoreParams, EpochRewardInput, LedgerEnv, RewardError, RewardParams, StakingError,
    StakingParams,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Economic error: {0}")]
    Economic(#[from] EconomicError),

    #[error("Staking error: {0}")]
    Staking(#[from] StakingError),

    #[error("Reward error: {0}")]
    Reward(#[from] RewardError),

    #[error("Bonus score error: {0}")]
    BonusScore(#[from] BonusScoreError),

    #[error("Rotation error: {0}")]
    Rotation(#[from] RotationError),

    #[error("Connectivity error: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("Parameter error: {0}")]
    Param(#[from] ParamError),

    #[error("caller {0} is not authorized")]
    Unauthorized(Address),

    #[error("block {number} does not extend head {head}")]
    StaleBlock { number: u64, head: u64 },

    #[error("block time {timestamp} is before the previous block time {last}")]
    TimeWentBackwards { timestamp: Timestamp, last: Timestamp },

    #[error("state codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// What one block did to the epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    pub transition_started: bool,
    pub epoch_ended: bool,
    /// New staking epoch, when the pending set was applied
    pub finalized: Option<EpochNumber>,
    pub minted: Amount,
    /// Validators penalised for bad performance and for how long they were faulty
    pub penalised: Vec<(Address, u64)>,
    /// A failed key generation round was replaced by a new draw
    pub key_gen_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochEngine {
    owner: Address,
    economics: EconomicLedgers,
    rotation: ValidatorRotation,
    connectivity: ConnectivityTracker,
    history: BlockHistory,
    last_block_time: Timestamp,
}

/// Engine handle shared between the consensus driver and RPC-style callers.
pub type SharedEngine = Arc<Mutex<EpochEngine>>;

impl EpochEngine {
    /// Build the engine from a validated config and the genesis block.
    pub fn genesis(config: EngineConfig, genesis: BlockContext) -> Result<Self, EngineError> {
        config.validate()?;
        let clock = EpochClock::genesis(config.epoch, genesis.timestamp, genesis.number);
        let mut economics =
            EconomicLedgers::genesis(clock, config.owner, config.staking, config.reward, config.bonus)?;

        for v in &config.genesis_validators {
            economics.stake.add_genesis_pool(v.staking, v.mining, v.stake, &economics.scores)?;
        }
        let miners: Vec<Address> = config.genesis_validators.iter().map(|v| v.mining).collect();
        let pools: Vec<Address> = config.genesis_validators.iter().map(|v| v.staking).collect();
        let rotation =
            ValidatorRotation::genesis(config.rotation.clone(), config.misbehavior_oracle, miners, genesis.timestamp)?;
        economics.stake.snapshot_pool_stakes(component::VALIDATOR_SET, 0, &pools)?;
        let connectivity = ConnectivityTracker::new(config.connectivity, config.owner)?;

        let mut history = BlockHistory::new();
        history.push(&genesis);

        info!(
            "Epoch engine started at block {} with {} genesis validators",
            genesis.number,
            pools.len()
        );
        Ok(EpochEngine {
            owner: config.owner,
            economics,
            rotation,
            connectivity,
            history,
            last_block_time: genesis.timestamp,
        })
    }

    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn economics(&self) -> &EconomicLedgers {
        &self.economics
    }

    pub fn rotation(&self) -> &ValidatorRotation {
        &self.rotation
    }

    pub fn connectivity(&self) -> &ConnectivityTracker {
        &self.connectivity
    }

    pub fn history(&self) -> &BlockHistory {
        &self.history
    }

    pub fn phase(&self) -> EpochPhase {
        self.rotation.phase()
    }

    pub fn staking_epoch(&self) -> EpochNumber {
        self.economics.stake.staking_epoch()
    }

    pub fn epoch_end_time(&self) -> Timestamp {
        self.economics.stake.clock().end_time()
    }

    /// Time of the latest block; user operations are evaluated at this time.
    pub fn now(&self) -> Timestamp {
        self.last_block_time
    }

    pub fn head(&self) -> u64 {
        self.history.head().unwrap_or(0)
    }

    pub fn current_validators(&self) -> &[Address] {
        self.rotation.current_validators()
    }

    pub fn pending_validators(&self) -> &[Address] {
        self.rotation.pending_validators()
    }

    pub fn mining_by_staking(&self, staking: &Address) -> Option<Address> {
        self.economics.stake.mining_by_staking(staking)
    }

    pub fn staking_by_mining(&self, mining: &Address) -> Option<Address> {
        self.economics.stake.staking_by_mining(mining)
    }

    /// Re-check cross-component invariants. Cheap enough for tests after every call.
    pub fn verify_invariants(&self) -> Result<(), EngineError> {
        self.economics.verify_invariants()?;
        if self.rotation.current_validators().is_empty() {
            return Err(StakingError::InvariantViolation("empty current validator set".to_string()).into());
        }
        for mining in self.rotation.current_validators() {
            if self.economics.stake.staking_by_mining(mining).is_none() {
                return Err(StakingError::InvariantViolation(format!("validator {} has no pool", mining)).into());
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    /// Run `f` against the engine; on error every component is restored.
    fn transact<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R, EngineError>) -> Result<R, EngineError> {
        let backup = self.clone();
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("Rolling back: {}", e);
                *self = backup;
                Err(e)
            }
        }
    }

    /// Per-block hook for the consensus driver.
    pub fn on_block(
        &mut self,
        caller: Address,
        ctx: BlockContext,
        keygen: &dyn KeyGenHistory,
    ) -> Result<BlockOutcome, EngineError> {
        if caller != SYSTEM_ADDRESS {
            warn!("Block hook called by {}", caller);
            return Err(EngineError::Unauthorized(caller));
        }
        self.transact(|engine| engine.step(ctx, keygen))
    }

    fn step(&mut self, ctx: BlockContext, keygen: &dyn KeyGenHistory) -> Result<BlockOutcome, EngineError> {
        let head = self.head();
        if ctx.number <= head {
            return Err(EngineError::StaleBlock { number: ctx.number, head });
        }
        if ctx.timestamp < self.last_block_time {
            return Err(EngineError::TimeWentBackwards { timestamp: ctx.timestamp, last: self.last_block_time });
        }
        self.history.push(&ctx);
        self.last_block_time = ctx.timestamp;

        let now = ctx.timestamp;
        let clock = *self.economics.stake.clock();
        let early = self.economics.rewards.is_early_epoch_end();
        let mut outcome = BlockOutcome::default();

        if self.rotation.phase() == EpochPhase::Regular && (now >= clock.transition_start() || early) {
            self.rotation.start_transition(now, clock.end_time(), &ctx.hash, &self.economics.stake)?;
            outcome.transition_started = true;
        }

        if self.rotation.phase() == EpochPhase::Transition && (clock.is_past_end(now) || early) {
            self.rotation.mark_ended(now)?;
            outcome.epoch_ended = true;
        }

        if self.rotation.phase() == EpochPhase::Ended {
            let next_epoch = clock.staking_epoch + 1;
            if keygen.is_key_ready(next_epoch, self.rotation.pending_validators()) {
                self.close_epoch(&clock, &ctx, &mut outcome)?;
            } else if now >= self.rotation.key_gen_deadline() {
                let economics = &mut self.economics;
                self.rotation.handle_failed_key_generation(
                    now,
                    &ctx.hash,
                    keygen,
                    &mut economics.stake,
                    &mut economics.scores,
                )?;
                outcome.key_gen_retry = true;
            } else {
                debug!("Waiting for the threshold key of epoch {}", next_epoch);
            }
        }
        Ok(outcome)
    }

    /// Penalise, reward and hand over to the pending set.
    fn close_epoch(
        &mut self,
        clock: &EpochClock,
        ctx: &BlockContext,
        outcome: &mut BlockOutcome,
    ) -> Result<(), EngineError> {
        let now = ctx.timestamp;
        let epoch = clock.staking_epoch;
        let economics = &mut self.economics;

        outcome.penalised = self.connectivity.penalise_faulty_validators(
            SYSTEM_ADDRESS,
            epoch,
            now,
            &mut economics.scores,
            &mut economics.stake,
        )?;

        let input = EpochRewardInput {
            epoch,
            epoch_start: clock.start_time,
            target_duration: clock.settings.fixed_duration,
            now,
            validators: self.rotation.current_validators().to_vec(),
        };
        outcome.minted = economics.rewards.reward(SYSTEM_ADDRESS, true, &input, &mut economics.stake, &self.rotation)?;

        match self.rotation.finalize_change(now, ctx.number, &mut economics.stake, &mut economics.scores)? {
            FinalizeOutcome::Applied { epoch: next, validators } => {
                info!("Epoch {} closed, epoch {} runs with {} validators", epoch, next, validators.len());
                outcome.finalized = Some(next);
            }
            FinalizeOutcome::AlreadyApplied => {
                error!("Epoch {} closed without a pending validator set", epoch);
            }
        }
        Ok(())
    }

    fn env(&self) -> LedgerEnv<'_> {
        LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores)
    }

    // ---------------------------------------------------------------------
    // Staker operations
    // ---------------------------------------------------------------------

    pub fn add_pool(&mut self, staking: Address, mining: Address, amount: Amount) -> Result<(), EngineError> {
        let env = LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores);
        Ok(self.economics.stake.add_pool(staking, mining, amount, &env)?)
    }

    pub fn remove_my_pool(&mut self, staking: Address) -> Result<(), EngineError> {
        let env = LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores);
        Ok(self.economics.stake.remove_my_pool(staking, &env)?)
    }

    pub fn stake(&mut self, staker: Address, pool: Address, amount: Amount) -> Result<(), EngineError> {
        let env = LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores);
        Ok(self.economics.stake.stake(pool, staker, amount, &env)?)
    }

    pub fn withdraw(&mut self, staker: Address, pool: Address, amount: Amount) -> Result<Amount, EngineError> {
        let env = LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores);
        Ok(self.economics.stake.withdraw(pool, staker, amount, &env)?)
    }

    pub fn order_withdraw(&mut self, staker: Address, pool: Address, amount: Amount) -> Result<(), EngineError> {
        let env = LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores);
        Ok(self.economics.stake.order_withdraw(pool, staker, amount, &env)?)
    }

    pub fn cancel_ordered_withdraw(&mut self, staker: Address, pool: Address, amount: Amount) -> Result<(), EngineError> {
        let env = LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores);
        Ok(self.economics.stake.cancel_ordered_withdraw(pool, staker, amount, &env)?)
    }

    pub fn claim_ordered_withdraw(&mut self, staker: Address, pool: Address) -> Result<Amount, EngineError> {
        let env = LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores);
        Ok(self.economics.stake.claim_ordered_withdraw(pool, staker, &env)?)
    }

    pub fn move_stake(&mut self, staker: Address, from: Address, to: Address, amount: Amount) -> Result<(), EngineError> {
        let env = LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores);
        Ok(self.economics.stake.move_stake(from, to, staker, amount, &env)?)
    }

    /// Empty `epochs` walks every unclaimed finished epoch.
    pub fn claim_reward(&mut self, staker: Address, pool: Address, epochs: &[EpochNumber]) -> Result<Amount, EngineError> {
        let env = LedgerEnv::new(self.last_block_time, &self.rotation, &self.economics.scores);
        Ok(self.economics.stake.claim_reward(epochs, pool, staker, &env)?)
    }

    pub fn max_withdraw_allowed(&self, staker: &Address, pool: &Address) -> Amount {
        self.economics.stake.max_withdraw_allowed(pool, staker, &self.env())
    }

    pub fn max_withdraw_order_allowed(&self, staker: &Address, pool: &Address) -> Amount {
        self.economics.stake.max_withdraw_order_allowed(pool, staker, &self.env())
    }

    // ---------------------------------------------------------------------
    // Validator operations
    // ---------------------------------------------------------------------

    pub fn announce_availability(
        &mut self,
        mining: Address,
        block_number: u64,
        block_hash: BlockHash,
    ) -> Result<(), EngineError> {
        let now = self.last_block_time;
        let economics = &mut self.economics;
        Ok(self.rotation.announce_availability(
            mining,
            block_number,
            block_hash,
            now,
            &self.history,
            &mut economics.stake,
            &mut economics.scores,
        )?)
    }

    fn report_env(&self) -> (EpochNumber, u64) {
        let clock = self.economics.stake.clock();
        (clock.staking_epoch, clock.start_block)
    }

    /// Act on what a report changed: zero the target's availability on quorum
    /// and ask for an early epoch end when too many validators are faulty.
    fn apply_report(&mut self, target: Address, outcome: ReportOutcome) -> Result<(), EngineError> {
        let now = self.last_block_time;
        if outcome.became_faulty {
            let economics = &mut self.economics;
            self.rotation.force_unavailable(
                component::CONNECTIVITY_TRACKER,
                target,
                now,
                &mut economics.stake,
                &mut economics.scores,
            )?;
        }
        if outcome.early_epoch_end {
            self.economics.rewards.notify_early_epoch_end(component::CONNECTIVITY_TRACKER)?;
        }
        Ok(())
    }

    pub fn report_missing_connectivity(
        &mut self,
        reporter: Address,
        target: Address,
        block_number: u64,
        block_hash: BlockHash,
    ) -> Result<ReportOutcome, EngineError> {
        self.transact(|engine| {
            let (epoch, epoch_start_block) = engine.report_env();
            let env = ReportEnv {
                epoch,
                epoch_start_block,
                now: engine.last_block_time,
                history: &engine.history,
                validators: engine.rotation.current_validators(),
            };
            let outcome = engine.connectivity.report_missing_connectivity(reporter, target, block_number, block_hash, &env)?;
            engine.apply_report(target, outcome)?;
            Ok(outcome)
        })
    }

    pub fn report_reconnect(
        &mut self,
        reporter: Address,
        target: Address,
        block_number: u64,
        block_hash: BlockHash,
    ) -> Result<ReportOutcome, EngineError> {
        let (epoch, epoch_start_block) = self.report_env();
        let env = ReportEnv {
            epoch,
            epoch_start_block,
            now: self.last_block_time,
            history: &self.history,
            validators: self.rotation.current_validators(),
        };
        Ok(self.connectivity.report_reconnect(reporter, target, block_number, block_hash, &env)?)
    }

    // ---------------------------------------------------------------------
    // Misbehavior oracle
    // ---------------------------------------------------------------------

    pub fn ban_validator(&mut self, caller: Address, mining: Address, until: Timestamp) -> Result<(), EngineError> {
        let now = self.last_block_time;
        self.transact(|engine| {
            let economics = &mut engine.economics;
            Ok(engine.rotation.ban_validator(caller, mining, until, now, &mut economics.stake, &mut economics.scores)?)
        })
    }

    pub fn remove_malicious_validators(&mut self, caller: Address, miners: &[Address]) -> Result<(), EngineError> {
        let now = self.last_block_time;
        self.transact(|engine| {
            let economics = &mut engine.economics;
            Ok(engine.rotation.remove_malicious_validators(
                caller,
                miners,
                now,
                &mut economics.stake,
                &mut economics.scores,
            )?)
        })
    }

    // ---------------------------------------------------------------------
    // Funding & governance
    // ---------------------------------------------------------------------

    pub fn add_to_delta_pot(&mut self, amount: Amount) -> Result<(), EngineError> {
        Ok(self.economics.rewards.add_to_delta_pot(amount)?)
    }

    pub fn add_to_reinsert_pot(&mut self, amount: Amount) -> Result<(), EngineError> {
        Ok(self.economics.rewards.add_to_reinsert_pot(amount)?)
    }

    pub fn set_governance_address(&mut self, caller: Address, governance: Address) -> Result<(), EngineError> {
        Ok(self.economics.rewards.set_governance_address(caller, governance)?)
    }

    /// Route a bounded parameter change to the component owning `key`.
    pub fn set_param(&mut self, caller: Address, key: &str, value: ParamValue) -> Result<ParamChange, EngineError> {
        if caller != self.owner {
            warn!("Unauthorized parameter change of {} from {}", key, caller);
            return Err(EngineError::Unauthorized(caller));
        }
        if StakingParams::registry()?.contains(key) {
            Ok(self.economics.stake.set_param(caller, key, value)?)
        } else if RewardParams::registry()?.contains(key) {
            Ok(self.economics.rewards.set_param(caller, key, value)?)
        } else if BonusScoreParams::registry()?.contains(key) {
            Ok(self.economics.scores.set_param(caller, key, value)?)
        } else if ConnectivityParams::registry()?.contains(key) {
            Ok(self.connectivity.set_param(caller, key, value)?)
        } else {
            Err(ParamError::UnknownParam(key.to_string()).into())
        }
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    pub fn encode_state(&self) -> Result<Vec<u8>, EngineError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode_state(bytes: &[u8]) -> Result<Self, EngineError> {
        let engine: EpochEngine = bincode::deserialize(bytes)?;
        engine.verify_invariants()?;
        Ok(engine)
    }
}
