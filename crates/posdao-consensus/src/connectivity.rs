// CONNECTIVITY FAULT TRACKER
// Validators report peers they lost contact with; enough reports make the
// target faulty, enough faulty validators end the epoch early.
//
// SAFETY INVARIANTS:
// 1. Only current validators report, never about themselves, never twice per epoch
// 2. A validator with an outstanding report against it cannot file new reports
// 3. Faulty iff reports > floor(2 * (n - 1) / 3) distinct other validators
// 4. The score penalty is applied once per epoch, at epoch end, to validators still faulty
// 5. Reports reference a canonical block inside the running epoch

use crate::block_history::BlockHistory;
use log::{debug, info, warn};
use posdao_core::{
    component, stepped_table, Address, BlockHash, BoundedParams, EpochNumber, Guarded, NonReentrant, ParamChange,
    ParamError, ParamValue, ReentrancyError, Timestamp, SYSTEM_ADDRESS,
};
use posdao_economics::{BonusScoreError, BonusScoreLedger, StakeLedger};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("caller {0} is not authorized")]
    Unauthorized(Address),

    #[error("{0} is not a current validator")]
    NotValidator(Address),

    #[error("validators cannot report themselves")]
    SelfReport,

    #[error("reporter {0} is flagged and cannot report until reconnected")]
    ReporterFlagged(Address),

    #[error("reports open at block {opens_at}, head is {head}")]
    ReportTooEarly { opens_at: u64, head: u64 },

    #[error("block {number} predates the epoch start block {epoch_start}")]
    BlockTooOld { number: u64, epoch_start: u64 },

    #[error("block {number} is ahead of the head {head}")]
    BlockTooNew { number: u64, head: u64 },

    #[error("block {number} is unknown or its hash does not match")]
    InvalidBlockReference { number: u64 },

    #[error("{reporter} already reported {target} in epoch {epoch}")]
    AlreadyReported { epoch: EpochNumber, reporter: Address, target: Address },

    #[error("{reporter} has no report against {target} in epoch {epoch}")]
    NotReported { epoch: EpochNumber, reporter: Address, target: Address },

    #[error("epoch {0} was already penalised")]
    EpochAlreadyPenalised(EpochNumber),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    BonusScore(#[from] BonusScoreError),

    #[error(transparent)]
    Reentrancy(#[from] ReentrancyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityParams {
    /// Blocks after the epoch start before reports are accepted
    pub min_report_age_blocks: u64,

    /// Subtracted from the fault tolerance to get the early end threshold
    pub early_epoch_end_tolerance_level: u64,
}

impl Default for ConnectivityParams {
    fn default() -> Self {
        ConnectivityParams { min_report_age_blocks: 10, early_epoch_end_tolerance_level: 2 }
    }
}

impl ConnectivityParams {
    pub const MIN_REPORT_AGE_BLOCKS: &'static str = "min_report_age_blocks";
    pub const EARLY_EPOCH_END_TOLERANCE_LEVEL: &'static str = "early_epoch_end_tolerance_level";

    pub fn registry() -> Result<BoundedParams<ConnectivityParams>, ParamError> {
        BoundedParams::<ConnectivityParams>::new()
            .register(
                Self::MIN_REPORT_AGE_BLOCKS,
                |p| p.min_report_age_blocks as ParamValue,
                |p, v| p.min_report_age_blocks = v as u64,
                stepped_table(0, 200, 5),
            )?
            .register(
                Self::EARLY_EPOCH_END_TOLERANCE_LEVEL,
                |p| p.early_epoch_end_tolerance_level as ParamValue,
                |p, v| p.early_epoch_end_tolerance_level = v as u64,
                stepped_table(0, 10, 1),
            )
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        Self::registry()?.verify(self)
    }
}

/// Chain view a report is checked against.
#[derive(Clone, Copy)]
pub struct ReportEnv<'a> {
    pub epoch: EpochNumber,
    pub epoch_start_block: u64,
    pub now: Timestamp,
    pub history: &'a BlockHistory,
    pub validators: &'a [Address],
}

/// What a report or reconnect changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportOutcome {
    /// Target crossed the fault quorum with this call
    pub became_faulty: bool,

    /// Target dropped back below the quorum with this call
    pub recovered: bool,

    /// The faulty count crossed the early end threshold with this call
    pub early_epoch_end: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EpochReports {
    /// target -> reporters
    reports: BTreeMap<Address, BTreeSet<Address>>,
    faulty_since: BTreeMap<Address, Timestamp>,
    early_epoch_end: bool,
    penalised: bool,
}

impl EpochReports {
    fn count(&self, target: &Address) -> usize {
        self.reports.get(target).map(|r| r.len()).unwrap_or(0)
    }

    fn is_flagged(&self, target: &Address) -> bool {
        self.count(target) > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityTracker {
    params: ConnectivityParams,
    owner: Address,
    epochs: BTreeMap<EpochNumber, EpochReports>,

    #[serde(skip)]
    guard: NonReentrant,
}

impl Guarded for ConnectivityTracker {
    const COMPONENT: &'static str = "connectivity tracker";

    fn guard_mut(&mut self) -> &mut NonReentrant {
        &mut self.guard
    }
}

/// Reports needed, strictly exceeded, for a target to be faulty in a set of `n`.
pub fn fault_quorum(n: usize) -> usize {
    2 * n.saturating_sub(1) / 3
}

impl ConnectivityTracker {
    pub fn new(params: ConnectivityParams, owner: Address) -> Result<Self, ConnectivityError> {
        params.validate()?;
        Ok(ConnectivityTracker { params, owner, epochs: BTreeMap::new(), guard: NonReentrant::default() })
    }

    pub fn params(&self) -> &ConnectivityParams {
        &self.params
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Faulty validators allowed before the epoch is cut short.
    pub fn early_epoch_end_threshold(&self, validator_count: usize) -> usize {
        let tolerance = validator_count.saturating_sub(1) / 3;
        tolerance.saturating_sub(self.params.early_epoch_end_tolerance_level as usize)
    }

    /// Validators with at least one outstanding report.
    pub fn flagged_validators(&self, epoch: EpochNumber) -> Vec<Address> {
        self.epochs
            .get(&epoch)
            .map(|e| e.reports.iter().filter(|(_, r)| !r.is_empty()).map(|(t, _)| *t).collect())
            .unwrap_or_default()
    }

    pub fn faulty_validators(&self, epoch: EpochNumber) -> Vec<Address> {
        self.epochs.get(&epoch).map(|e| e.faulty_since.keys().copied().collect()).unwrap_or_default()
    }

    pub fn is_faulty(&self, epoch: EpochNumber, target: &Address) -> bool {
        self.epochs.get(&epoch).map(|e| e.faulty_since.contains_key(target)).unwrap_or(false)
    }

    /// Number of validators currently reporting `target`.
    pub fn connectivity_score(&self, epoch: EpochNumber, target: &Address) -> usize {
        self.epochs.get(&epoch).map(|e| e.count(target)).unwrap_or(0)
    }

    pub fn is_reported(&self, epoch: EpochNumber, target: &Address, reporter: &Address) -> bool {
        self.epochs
            .get(&epoch)
            .and_then(|e| e.reports.get(target))
            .map(|r| r.contains(reporter))
            .unwrap_or(false)
    }

    pub fn is_early_epoch_end(&self, epoch: EpochNumber) -> bool {
        self.epochs.get(&epoch).map(|e| e.early_epoch_end).unwrap_or(false)
    }

    pub fn is_penalised(&self, epoch: EpochNumber) -> bool {
        self.epochs.get(&epoch).map(|e| e.penalised).unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // Reports
    // ---------------------------------------------------------------------

    fn check_report(
        &self,
        reporter: &Address,
        target: &Address,
        block_number: u64,
        block_hash: &BlockHash,
        env: &ReportEnv<'_>,
    ) -> Result<(), ConnectivityError> {
        if !env.validators.contains(reporter) {
            warn!("Connectivity report from non-validator {}", reporter);
            return Err(ConnectivityError::NotValidator(*reporter));
        }
        if !env.validators.contains(target) {
            return Err(ConnectivityError::NotValidator(*target));
        }
        if reporter == target {
            return Err(ConnectivityError::SelfReport);
        }

        let head = env.history.head().unwrap_or(0);
        let opens_at = env.epoch_start_block.saturating_add(self.params.min_report_age_blocks);
        if head < opens_at {
            return Err(ConnectivityError::ReportTooEarly { opens_at, head });
        }
        if block_number < env.epoch_start_block {
            return Err(ConnectivityError::BlockTooOld { number: block_number, epoch_start: env.epoch_start_block });
        }
        if block_number > head {
            warn!("{} referenced future block {} (head {})", reporter, block_number, head);
            return Err(ConnectivityError::BlockTooNew { number: block_number, head });
        }
        if !env.history.matches(block_number, block_hash) {
            warn!("{} referenced a non-canonical block {}", reporter, block_number);
            return Err(ConnectivityError::InvalidBlockReference { number: block_number });
        }
        Ok(())
    }

    /// `reporter` lost contact with `target`.
    pub fn report_missing_connectivity(
        &mut self,
        reporter: Address,
        target: Address,
        block_number: u64,
        block_hash: BlockHash,
        env: &ReportEnv<'_>,
    ) -> Result<ReportOutcome, ConnectivityError> {
        self.non_reentrant(|tracker| {
            tracker.check_report(&reporter, &target, block_number, &block_hash, env)?;
            let epoch = env.epoch;
            if tracker.epochs.get(&epoch).map(|e| e.is_flagged(&reporter)).unwrap_or(false) {
                warn!("Flagged validator {} tried to report {}", reporter, target);
                return Err(ConnectivityError::ReporterFlagged(reporter));
            }
            if tracker.is_reported(epoch, &target, &reporter) {
                warn!("Duplicate report of {} by {} in epoch {}", target, reporter, epoch);
                return Err(ConnectivityError::AlreadyReported { epoch, reporter, target });
            }

            let n = env.validators.len();
            let threshold = tracker.early_epoch_end_threshold(n);
            let reports = tracker.epochs.entry(epoch).or_default();
            reports.reports.entry(target).or_default().insert(reporter);
            let count = reports.count(&target);

            let mut outcome = ReportOutcome::default();
            if count > fault_quorum(n) && !reports.faulty_since.contains_key(&target) {
                reports.faulty_since.insert(target, env.now);
                outcome.became_faulty = true;
                warn!("Validator {} is faulty in epoch {} ({} of {} reported)", target, epoch, count, n - 1);
                if !reports.early_epoch_end && reports.faulty_since.len() > threshold {
                    reports.early_epoch_end = true;
                    outcome.early_epoch_end = true;
                    warn!(
                        "Epoch {} ends early: {} faulty validators exceed threshold {}",
                        epoch,
                        reports.faulty_since.len(),
                        threshold
                    );
                }
            }
            info!("{} reported {} in epoch {} ({} reports)", reporter, target, epoch, count);
            Ok(outcome)
        })
    }

    /// `reporter` sees `target` again and withdraws its report.
    pub fn report_reconnect(
        &mut self,
        reporter: Address,
        target: Address,
        block_number: u64,
        block_hash: BlockHash,
        env: &ReportEnv<'_>,
    ) -> Result<ReportOutcome, ConnectivityError> {
        self.non_reentrant(|tracker| {
            tracker.check_report(&reporter, &target, block_number, &block_hash, env)?;
            let epoch = env.epoch;
            if !tracker.is_reported(epoch, &target, &reporter) {
                return Err(ConnectivityError::NotReported { epoch, reporter, target });
            }

            let n = env.validators.len();
            let mut outcome = ReportOutcome::default();
            if let Some(reports) = tracker.epochs.get_mut(&epoch) {
                if let Some(reporters) = reports.reports.get_mut(&target) {
                    reporters.remove(&reporter);
                    if reporters.is_empty() {
                        reports.reports.remove(&target);
                    }
                }
                if reports.count(&target) <= fault_quorum(n) && reports.faulty_since.remove(&target).is_some() {
                    outcome.recovered = true;
                    info!("Validator {} is no longer faulty in epoch {}", target, epoch);
                }
            }
            debug!("{} reconnected to {} in epoch {}", reporter, target, epoch);
            Ok(outcome)
        })
    }

    /// Apply the bad performance penalty to everyone still faulty. System call,
    /// once per epoch. Returns the penalised validators and how long each was faulty.
    pub fn penalise_faulty_validators(
        &mut self,
        caller: Address,
        epoch: EpochNumber,
        now: Timestamp,
        scores: &mut BonusScoreLedger,
        ledger: &mut StakeLedger,
    ) -> Result<Vec<(Address, u64)>, ConnectivityError> {
        self.non_reentrant(|tracker| {
            if caller != SYSTEM_ADDRESS {
                warn!("Unauthorized penalty call from {}", caller);
                return Err(ConnectivityError::Unauthorized(caller));
            }
            let reports = tracker.epochs.entry(epoch).or_default();
            if reports.penalised {
                return Err(ConnectivityError::EpochAlreadyPenalised(epoch));
            }

            let faulty: Vec<(Address, u64)> =
                reports.faulty_since.iter().map(|(target, since)| (*target, now.saturating_sub(*since))).collect();
            for (target, faulty_for) in &faulty {
                scores.penalise_bad_performance(component::CONNECTIVITY_TRACKER, *target, *faulty_for, now, ledger)?;
            }
            if let Some(reports) = tracker.epochs.get_mut(&epoch) {
                reports.penalised = true;
            }
            // only the running and the previous epoch stay queryable
            tracker.epochs.retain(|e, _| *e + 1 >= epoch);

            info!("Epoch {}: {} faulty validators penalised", epoch, faulty.len());
            Ok(faulty)
        })
    }

    pub fn set_param(&mut self, caller: Address, key: &str, value: ParamValue) -> Result<ParamChange, ConnectivityError> {
        if caller != self.owner {
            warn!("Unauthorized connectivity parameter change from {}", caller);
            return Err(ConnectivityError::Unauthorized(caller));
        }
        Ok(ConnectivityParams::registry()?.set(&mut self.params, key, value)?)
    }
}
