// VALIDATOR ROTATION
// Current / pending validator sets, availability, bans and the epoch handoff.
//
// SAFETY INVARIANTS:
// 1. The pending set is elected only from available, unbanned, active pools
// 2. The handoff replaces the current set atomically and exactly once per epoch
// 3. Re-finalizing an already applied set is a no-op, never an error
// 4. Zero eligible pools is fatal: the epoch does not advance
// 5. Only the misbehavior oracle can ban; only the connectivity tracker can force unavailability

use crate::block_history::BlockHistory;
use crate::committee::{elect_weighted, CommitteeSizing, SizingError};
use crate::epoch::EpochPhase;
use crate::key_gen::KeyGenHistory;
use log::{debug, error, info, warn};
use posdao_core::{
    component, Address, BlockHash, EpochNumber, Guarded, NonReentrant, ReentrancyError, Timestamp, ValidatorStatus,
};
use posdao_economics::{BonusScoreError, BonusScoreLedger, StakeLedger, StakingError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RotationError {
    #[error("caller {0} is not authorized")]
    Unauthorized(Address),

    #[error("{0} is not bound to any pool")]
    UnknownValidator(Address),

    #[error("{mining} is banned until {until}")]
    Banned { mining: Address, until: Timestamp },

    #[error("{0} already announced availability")]
    AlreadyAvailable(Address),

    #[error("block {number} is unknown or its hash does not match")]
    InvalidBlockReference { number: u64 },

    #[error("no eligible pools to elect from")]
    NoEligiblePools,

    #[error("no pending validators")]
    NoPendingValidators,

    #[error("expected phase {expected:?}, found {actual:?}")]
    InvalidPhase { expected: EpochPhase, actual: EpochPhase },

    #[error("empty initial validator set")]
    EmptyGenesisSet,

    #[error(transparent)]
    Sizing(#[from] SizingError),

    #[error(transparent)]
    Staking(#[from] StakingError),

    #[error(transparent)]
    BonusScore(#[from] BonusScoreError),

    #[error(transparent)]
    Reentrancy(#[from] ReentrancyError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationParams {
    /// Hard upper bound for the committee
    pub max_validators: usize,

    /// How long `remove_malicious_validators` bans for (seconds)
    pub ban_duration: u64,

    /// Grace period for threshold key generation after the epoch end
    pub key_gen_extra_time_window: u64,

    /// (min_candidates, committee_size) steps; see `CommitteeSizing`
    pub sizing_steps: Vec<(usize, usize)>,
}

impl Default for RotationParams {
    fn default() -> Self {
        let max_validators = 25;
        RotationParams {
            max_validators,
            ban_duration: 90 * 24 * 60 * 60,
            key_gen_extra_time_window: 15 * 60,
            sizing_steps: CommitteeSizing::byzantine_sweet_spots(max_validators).steps().to_vec(),
        }
    }
}

impl RotationParams {
    pub fn sizing(&self) -> Result<CommitteeSizing, SizingError> {
        CommitteeSizing::new(self.sizing_steps.clone(), self.max_validators)
    }

    pub fn validate(&self) -> Result<(), SizingError> {
        self.sizing().map(|_| ())
    }
}

/// Result of a finalize attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// New set applied; carries the new staking epoch.
    Applied { epoch: EpochNumber, validators: Vec<Address> },
    /// Nothing pending, the set is already in force.
    AlreadyApplied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorRotation {
    params: RotationParams,
    sizing: CommitteeSizing,

    /// Only address allowed to ban
    misbehavior_oracle: Address,

    phase: EpochPhase,

    /// Mining addresses
    current: Vec<Address>,
    pending: Vec<Address>,
    previous: Vec<Address>,

    /// Present while available; value is the announcement time
    available_since: BTreeMap<Address, Timestamp>,

    /// Present while unavailable after having been tracked
    unavailable_since: BTreeMap<Address, Timestamp>,

    banned_until: BTreeMap<Address, Timestamp>,
    ban_count: BTreeMap<Address, u32>,

    /// Failed key generation rounds for the pending set
    key_gen_round: u64,

    /// When the running key generation round gives up
    key_gen_deadline: Timestamp,

    #[serde(skip)]
    guard: NonReentrant,
}

impl Guarded for ValidatorRotation {
    const COMPONENT: &'static str = "validator set";

    fn guard_mut(&mut self) -> &mut NonReentrant {
        &mut self.guard
    }
}

impl ValidatorStatus for ValidatorRotation {
    fn is_validator_or_pending(&self, mining: &Address) -> bool {
        self.is_validator(mining) || self.is_pending_validator(mining)
    }

    fn is_banned(&self, mining: &Address, now: Timestamp) -> bool {
        self.is_validator_banned(mining, now)
    }
}

impl ValidatorRotation {
    /// Initial committee, all of it available from `now`.
    pub fn genesis(
        params: RotationParams,
        misbehavior_oracle: Address,
        initial: Vec<Address>,
        now: Timestamp,
    ) -> Result<Self, RotationError> {
        let sizing = params.sizing()?;
        if initial.is_empty() {
            return Err(RotationError::EmptyGenesisSet);
        }
        let available_since = initial.iter().map(|m| (*m, now)).collect();
        info!("Genesis validator set with {} validators", initial.len());
        Ok(ValidatorRotation {
            params,
            sizing,
            misbehavior_oracle,
            phase: EpochPhase::Regular,
            current: initial,
            pending: Vec::new(),
            previous: Vec::new(),
            available_since,
            unavailable_since: BTreeMap::new(),
            banned_until: BTreeMap::new(),
            ban_count: BTreeMap::new(),
            key_gen_round: 0,
            key_gen_deadline: 0,
            guard: NonReentrant::default(),
        })
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn params(&self) -> &RotationParams {
        &self.params
    }

    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    pub fn current_validators(&self) -> &[Address] {
        &self.current
    }

    pub fn pending_validators(&self) -> &[Address] {
        &self.pending
    }

    pub fn previous_validators(&self) -> &[Address] {
        &self.previous
    }

    pub fn is_validator(&self, mining: &Address) -> bool {
        self.current.contains(mining)
    }

    pub fn is_pending_validator(&self, mining: &Address) -> bool {
        self.pending.contains(mining)
    }

    pub fn banned_until(&self, mining: &Address) -> Option<Timestamp> {
        self.banned_until.get(mining).copied()
    }

    pub fn ban_count(&self, mining: &Address) -> u32 {
        self.ban_count.get(mining).copied().unwrap_or(0)
    }

    pub fn is_validator_banned(&self, mining: &Address, now: Timestamp) -> bool {
        self.banned_until.get(mining).map(|until| now < *until).unwrap_or(false)
    }

    /// Announcement time, or `None` while unavailable.
    pub fn validator_available_since(&self, mining: &Address) -> Option<Timestamp> {
        self.available_since.get(mining).copied()
    }

    pub fn is_available(&self, mining: &Address) -> bool {
        self.available_since.contains_key(mining)
    }

    pub fn key_gen_round(&self) -> u64 {
        self.key_gen_round
    }

    pub fn key_gen_deadline(&self) -> Timestamp {
        self.key_gen_deadline
    }

    pub fn committee_size(&self, candidates: usize) -> usize {
        self.sizing.committee_size(candidates)
    }

    fn require_caller(caller: Address, expected: Address) -> Result<(), RotationError> {
        if caller != expected {
            warn!("Unauthorized validator set call from {}", caller);
            return Err(RotationError::Unauthorized(caller));
        }
        Ok(())
    }

    fn require_phase(&self, expected: EpochPhase) -> Result<(), RotationError> {
        if self.phase != expected {
            return Err(RotationError::InvalidPhase { expected, actual: self.phase });
        }
        Ok(())
    }

    fn staking_of(ledger: &StakeLedger, mining: &Address) -> Result<Address, RotationError> {
        ledger.staking_by_mining(mining).ok_or(RotationError::UnknownValidator(*mining))
    }

    // ---------------------------------------------------------------------
    // Availability
    // ---------------------------------------------------------------------

    /// Node operator signals liveness, referencing a recent canonical block.
    #[allow(clippy::too_many_arguments)]
    pub fn announce_availability(
        &mut self,
        mining: Address,
        block_number: u64,
        block_hash: BlockHash,
        now: Timestamp,
        history: &BlockHistory,
        ledger: &mut StakeLedger,
        scores: &mut BonusScoreLedger,
    ) -> Result<(), RotationError> {
        self.non_reentrant(|rotation| {
            Self::staking_of(ledger, &mining)?;
            if let Some(until) = rotation.banned_until(&mining).filter(|u| now < *u) {
                return Err(RotationError::Banned { mining, until });
            }
            if !history.matches(block_number, &block_hash) {
                warn!("Availability of {} references unknown block {}", mining, block_number);
                return Err(RotationError::InvalidBlockReference { number: block_number });
            }
            if rotation.is_available(&mining) {
                return Err(RotationError::AlreadyAvailable(mining));
            }

            if let Some(since) = rotation.unavailable_since.get(&mining).copied() {
                if !rotation.is_validator(&mining) {
                    scores.penalise_no_stand_by(component::VALIDATOR_SET, mining, since, now, ledger)?;
                }
            }
            rotation.unavailable_since.remove(&mining);
            rotation.available_since.insert(mining, now);
            info!("{} announced availability at {}", mining, now);
            Ok(())
        })
    }

    fn set_unavailable(
        &mut self,
        mining: Address,
        now: Timestamp,
        ledger: &mut StakeLedger,
        scores: &mut BonusScoreLedger,
    ) -> Result<(), RotationError> {
        if let Some(since) = self.available_since.remove(&mining) {
            if !self.is_validator(&mining) && ledger.staking_by_mining(&mining).is_some() {
                scores.reward_stand_by(component::VALIDATOR_SET, mining, since, now, ledger)?;
            }
        }
        self.unavailable_since.entry(mining).or_insert(now);
        Ok(())
    }

    /// Zero a validator's availability after a connectivity fault quorum.
    pub fn force_unavailable(
        &mut self,
        caller: Address,
        mining: Address,
        now: Timestamp,
        ledger: &mut StakeLedger,
        scores: &mut BonusScoreLedger,
    ) -> Result<(), RotationError> {
        self.non_reentrant(|rotation| {
            Self::require_caller(caller, component::CONNECTIVITY_TRACKER)?;
            rotation.set_unavailable(mining, now, ledger, scores)?;
            warn!("{} marked unavailable by the connectivity tracker", mining);
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Bans
    // ---------------------------------------------------------------------

    fn ban(
        &mut self,
        mining: Address,
        until: Timestamp,
        now: Timestamp,
        ledger: &mut StakeLedger,
        scores: &mut BonusScoreLedger,
    ) -> Result<(), RotationError> {
        Self::staking_of(ledger, &mining)?;
        let until = self.banned_until.get(&mining).map(|u| (*u).max(until)).unwrap_or(until);
        self.banned_until.insert(mining, until);
        *self.ban_count.entry(mining).or_insert(0) += 1;
        self.set_unavailable(mining, now, ledger, scores)?;
        ledger.deactivate_pool(component::VALIDATOR_SET, &mining, &*self)?;
        error!("Validator {} banned until {}", mining, until);
        Ok(())
    }

    /// Misbehavior oracle entry point.
    pub fn ban_validator(
        &mut self,
        caller: Address,
        mining: Address,
        until: Timestamp,
        now: Timestamp,
        ledger: &mut StakeLedger,
        scores: &mut BonusScoreLedger,
    ) -> Result<(), RotationError> {
        self.non_reentrant(|rotation| {
            Self::require_caller(caller, rotation.misbehavior_oracle)?;
            rotation.ban(mining, until, now, ledger, scores)
        })
    }

    /// Ban every listed validator for the configured ban duration.
    pub fn remove_malicious_validators(
        &mut self,
        caller: Address,
        miners: &[Address],
        now: Timestamp,
        ledger: &mut StakeLedger,
        scores: &mut BonusScoreLedger,
    ) -> Result<(), RotationError> {
        self.non_reentrant(|rotation| {
            Self::require_caller(caller, rotation.misbehavior_oracle)?;
            for mining in miners {
                Self::staking_of(ledger, mining)?;
            }
            let until = now.saturating_add(rotation.params.ban_duration);
            for mining in miners {
                rotation.ban(*mining, until, now, ledger, scores)?;
            }
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Epoch handoff
    // ---------------------------------------------------------------------

    /// Weighted candidates: electable pools whose node is available and not banned.
    fn eligible_candidates(&self, ledger: &StakeLedger, now: Timestamp) -> Vec<(Address, u128)> {
        let (weights, _) = ledger.pools_likelihood();
        weights
            .into_iter()
            .filter_map(|(staking, weight)| ledger.mining_by_staking(&staking).map(|m| (m, weight)))
            .filter(|(mining, _)| self.is_available(mining) && !self.is_validator_banned(mining, now))
            .collect()
    }

    fn elect(&self, ledger: &StakeLedger, now: Timestamp, seed: &BlockHash) -> Result<Vec<Address>, RotationError> {
        let candidates = self.eligible_candidates(ledger, now);
        if candidates.is_empty() {
            error!("No eligible pools at {}: epoch cannot advance", now);
            return Err(RotationError::NoEligiblePools);
        }
        let count = self.sizing.committee_size(candidates.len());
        let elected = elect_weighted(&candidates, count, seed);
        debug!("Elected {} of {} candidates", elected.len(), candidates.len());
        Ok(elected)
    }

    /// Elect the next committee and enter the transition phase.
    pub fn start_transition(
        &mut self,
        now: Timestamp,
        epoch_end: Timestamp,
        seed: &BlockHash,
        ledger: &StakeLedger,
    ) -> Result<Vec<Address>, RotationError> {
        self.non_reentrant(|rotation| {
            rotation.require_phase(EpochPhase::Regular)?;
            let elected = rotation.elect(ledger, now, seed)?;
            rotation.pending = elected.clone();
            rotation.phase = EpochPhase::Transition;
            rotation.key_gen_round = 0;
            rotation.key_gen_deadline = epoch_end.max(now).saturating_add(rotation.params.key_gen_extra_time_window);
            info!(
                "Transition started at {}: {} pending validators for epoch {}",
                now,
                elected.len(),
                ledger.staking_epoch() + 1
            );
            Ok(elected)
        })
    }

    /// The running epoch reached its end (scheduled or forced).
    ///
    /// The key generation deadline is re-anchored to `now`, so a forced early
    /// end waits one window for the threshold key, not the scheduled end plus one.
    pub fn mark_ended(&mut self, now: Timestamp) -> Result<(), RotationError> {
        self.require_phase(EpochPhase::Transition)?;
        self.phase = EpochPhase::Ended;
        self.key_gen_deadline = now.saturating_add(self.params.key_gen_extra_time_window);
        info!("Epoch ended at {}, waiting for the threshold key until {}", now, self.key_gen_deadline);
        Ok(())
    }

    /// Stand-by accounting for pools that sat out the epoch that just ended.
    fn settle_stand_by(
        &mut self,
        now: Timestamp,
        ledger: &mut StakeLedger,
        scores: &mut BonusScoreLedger,
    ) -> Result<(), RotationError> {
        let outgoing: BTreeSet<Address> = self.current.iter().copied().collect();
        let candidates: Vec<Address> =
            ledger.pools().iter().filter_map(|staking| ledger.mining_by_staking(staking)).collect();
        for mining in candidates {
            if outgoing.contains(&mining) || self.is_validator_banned(&mining, now) {
                continue;
            }
            if let Some(since) = self.available_since.get(&mining).copied() {
                scores.reward_stand_by(component::VALIDATOR_SET, mining, since, now, ledger)?;
            } else if let Some(since) = self.unavailable_since.get(&mining).copied() {
                scores.penalise_no_stand_by(component::VALIDATOR_SET, mining, since, now, ledger)?;
            }
        }
        Ok(())
    }

    /// Activate the pending set and start the next staking epoch.
    pub fn finalize_change(
        &mut self,
        now: Timestamp,
        block: u64,
        ledger: &mut StakeLedger,
        scores: &mut BonusScoreLedger,
    ) -> Result<FinalizeOutcome, RotationError> {
        self.non_reentrant(|rotation| {
            if rotation.phase == EpochPhase::Regular && rotation.pending.is_empty() {
                debug!("Validator set already applied");
                return Ok(FinalizeOutcome::AlreadyApplied);
            }
            rotation.require_phase(EpochPhase::Ended)?;
            if rotation.pending.is_empty() {
                return Err(RotationError::NoPendingValidators);
            }

            rotation.settle_stand_by(now, ledger, scores)?;

            rotation.previous = std::mem::take(&mut rotation.current);
            rotation.current = std::mem::take(&mut rotation.pending);
            rotation.phase = EpochPhase::Regular;
            rotation.key_gen_round = 0;

            let epoch = ledger.begin_epoch(component::VALIDATOR_SET, now, block)?;
            ledger.finalize_pool_removals(component::VALIDATOR_SET, &*rotation)?;
            let pools = rotation
                .current
                .iter()
                .map(|m| Self::staking_of(ledger, m))
                .collect::<Result<Vec<_>, _>>()?;
            ledger.snapshot_pool_stakes(component::VALIDATOR_SET, epoch, &pools)?;

            info!("Epoch {} started with {} validators", epoch, rotation.current.len());
            Ok(FinalizeOutcome::Applied { epoch, validators: rotation.current.clone() })
        })
    }

    /// Key generation did not finish in time: penalise the pending validators
    /// that wrote nothing, drop them from availability and draw a new set.
    pub fn handle_failed_key_generation(
        &mut self,
        now: Timestamp,
        seed: &BlockHash,
        keygen: &dyn KeyGenHistory,
        ledger: &mut StakeLedger,
        scores: &mut BonusScoreLedger,
    ) -> Result<Vec<Address>, RotationError> {
        self.non_reentrant(|rotation| {
            rotation.require_phase(EpochPhase::Ended)?;
            let next_epoch = ledger.staking_epoch() + 1;
            let missing = keygen.missing_key_writers(next_epoch, &rotation.pending);
            for mining in &missing {
                scores.penalise_no_key_write(component::VALIDATOR_SET, *mining, now, ledger)?;
                rotation.set_unavailable(*mining, now, ledger, scores)?;
                warn!("{} did not write key material for epoch {}", mining, next_epoch);
            }

            let elected = rotation.elect(ledger, now, seed)?;
            rotation.pending = elected.clone();
            rotation.key_gen_round += 1;
            rotation.key_gen_deadline = now.saturating_add(rotation.params.key_gen_extra_time_window);
            info!(
                "Key generation round {} for epoch {}: {} pending validators",
                rotation.key_gen_round,
                next_epoch,
                elected.len()
            );
            Ok(elected)
        })
    }
}
