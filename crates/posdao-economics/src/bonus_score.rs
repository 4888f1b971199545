/// BONUS SCORE LEDGER
///
/// Bounded reputation per mining address. The score grows while a candidate
/// waits available but unelected, and shrinks when it is unavailable, fails to
/// write key material or is found faulty by the connectivity tracker. Every
/// change is pushed into the stake ledger as a new election likelihood.

use crate::stake_ledger::{StakeLedger, StakingError};
use log::{debug, info, warn};
use posdao_core::{
    component, stepped_table, Address, BoundedParams, Guarded, NonReentrant, ParamChange, ParamError,
    ParamValue, ReentrancyError, ScoreSource, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MIN_SCORE: u64 = 1;
pub const MAX_SCORE: u64 = 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BonusScoreError {
    #[error("caller {0} is not authorized")]
    Unauthorized(Address),

    #[error("zero mining address")]
    ZeroAddress,

    #[error("epoch duration must be > 0")]
    ZeroEpochDuration,

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Staking(#[from] StakingError),

    #[error(transparent)]
    Reentrancy(#[from] ReentrancyError),
}

/// How many points per epoch each kind of event is worth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusScoreParams {
    pub stand_by_factor: u64,
    pub no_stand_by_factor: u64,
    pub no_key_write_factor: u64,
    pub bad_performance_factor: u64,
}

impl Default for BonusScoreParams {
    fn default() -> Self {
        BonusScoreParams {
            stand_by_factor: 15,
            no_stand_by_factor: 15,
            no_key_write_factor: 100,
            bad_performance_factor: 100,
        }
    }
}

impl BonusScoreParams {
    pub const STAND_BY_FACTOR: &'static str = "stand_by_factor";
    pub const NO_STAND_BY_FACTOR: &'static str = "no_stand_by_factor";
    pub const NO_KEY_WRITE_FACTOR: &'static str = "no_key_write_factor";
    pub const BAD_PERFORMANCE_FACTOR: &'static str = "bad_performance_factor";

    pub fn registry() -> Result<BoundedParams<BonusScoreParams>, ParamError> {
        BoundedParams::<BonusScoreParams>::new()
            .register(
                Self::STAND_BY_FACTOR,
                |p| p.stand_by_factor as ParamValue,
                |p, v| p.stand_by_factor = v as u64,
                stepped_table(5, 50, 5),
            )?
            .register(
                Self::NO_STAND_BY_FACTOR,
                |p| p.no_stand_by_factor as ParamValue,
                |p, v| p.no_stand_by_factor = v as u64,
                stepped_table(5, 50, 5),
            )?
            .register(
                Self::NO_KEY_WRITE_FACTOR,
                |p| p.no_key_write_factor as ParamValue,
                |p, v| p.no_key_write_factor = v as u64,
                stepped_table(10, 200, 10),
            )?
            .register(
                Self::BAD_PERFORMANCE_FACTOR,
                |p| p.bad_performance_factor as ParamValue,
                |p, v| p.bad_performance_factor = v as u64,
                stepped_table(10, 200, 10),
            )
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        Self::registry()?.verify(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusScoreLedger {
    params: BonusScoreParams,
    owner: Address,

    /// Fixed staking epoch duration the per-point rates are derived from
    epoch_duration: u64,

    scores: BTreeMap<Address, u64>,
    last_change: BTreeMap<Address, Timestamp>,

    #[serde(skip)]
    guard: NonReentrant,
}

impl Guarded for BonusScoreLedger {
    const COMPONENT: &'static str = "bonus score";

    fn guard_mut(&mut self) -> &mut NonReentrant {
        &mut self.guard
    }
}

impl ScoreSource for BonusScoreLedger {
    fn score_of(&self, mining: &Address) -> u64 {
        BonusScoreLedger::score_of(self, mining)
    }
}

impl BonusScoreLedger {
    pub fn new(params: BonusScoreParams, owner: Address, epoch_duration: u64) -> Result<Self, BonusScoreError> {
        params.validate()?;
        if epoch_duration == 0 {
            return Err(BonusScoreError::ZeroEpochDuration);
        }
        Ok(BonusScoreLedger {
            params,
            owner,
            epoch_duration,
            scores: BTreeMap::new(),
            last_change: BTreeMap::new(),
            guard: NonReentrant::default(),
        })
    }

    pub fn params(&self) -> &BonusScoreParams {
        &self.params
    }

    /// Current score. Addresses never scored sit at the floor.
    pub fn score_of(&self, mining: &Address) -> u64 {
        self.scores.get(mining).copied().unwrap_or(MIN_SCORE)
    }

    pub fn last_score_change(&self, mining: &Address) -> Option<Timestamp> {
        self.last_change.get(mining).copied()
    }

    /// Seconds it takes to earn or lose one point at the given factor.
    pub fn time_per_point(&self, factor: u64) -> u64 {
        (self.epoch_duration / factor.max(1)).max(1)
    }

    fn require_caller(caller: Address, expected: Address) -> Result<(), BonusScoreError> {
        if caller != expected {
            warn!("Unauthorized bonus score call from {}", caller);
            return Err(BonusScoreError::Unauthorized(caller));
        }
        Ok(())
    }

    /// Whole points accumulated over `[max(since, last change), now)` at `factor`.
    fn interval_points(&self, mining: &Address, since: Timestamp, now: Timestamp, factor: u64) -> u64 {
        let from = since.max(self.last_change.get(mining).copied().unwrap_or(0));
        now.saturating_sub(from) / self.time_per_point(factor)
    }

    fn apply(
        &mut self,
        mining: Address,
        delta: i128,
        now: Timestamp,
        ledger: &mut StakeLedger,
    ) -> Result<u64, BonusScoreError> {
        if mining.is_zero() {
            return Err(BonusScoreError::ZeroAddress);
        }
        let old = self.score_of(&mining);
        let new = (old as i128 + delta).clamp(MIN_SCORE as i128, MAX_SCORE as i128) as u64;
        ledger.update_likelihood(component::BONUS_SCORE, &mining, new)?;
        self.scores.insert(mining, new);
        self.last_change.insert(mining, now);
        debug!("Score of {}: {} -> {}", mining, old, new);
        Ok(new)
    }

    /// Reward a candidate that stayed available without being elected.
    pub fn reward_stand_by(
        &mut self,
        caller: Address,
        mining: Address,
        available_since: Timestamp,
        now: Timestamp,
        ledger: &mut StakeLedger,
    ) -> Result<u64, BonusScoreError> {
        self.non_reentrant(|scores| {
            Self::require_caller(caller, component::VALIDATOR_SET)?;
            let points = scores.interval_points(&mining, available_since, now, scores.params.stand_by_factor);
            if points == 0 {
                return Ok(scores.score_of(&mining));
            }
            let score = scores.apply(mining, points as i128, now, ledger)?;
            info!("Stand-by bonus for {}: +{} (score {})", mining, points, score);
            Ok(score)
        })
    }

    /// Penalise a candidate for the time it was not available.
    pub fn penalise_no_stand_by(
        &mut self,
        caller: Address,
        mining: Address,
        unavailable_since: Timestamp,
        now: Timestamp,
        ledger: &mut StakeLedger,
    ) -> Result<u64, BonusScoreError> {
        self.non_reentrant(|scores| {
            Self::require_caller(caller, component::VALIDATOR_SET)?;
            let points = scores.interval_points(&mining, unavailable_since, now, scores.params.no_stand_by_factor);
            if points == 0 {
                return Ok(scores.score_of(&mining));
            }
            let score = scores.apply(mining, -(points as i128), now, ledger)?;
            info!("No-stand-by penalty for {}: -{} (score {})", mining, points, score);
            Ok(score)
        })
    }

    /// Penalise a pending validator that never wrote its key-generation parts.
    pub fn penalise_no_key_write(
        &mut self,
        caller: Address,
        mining: Address,
        now: Timestamp,
        ledger: &mut StakeLedger,
    ) -> Result<u64, BonusScoreError> {
        self.non_reentrant(|scores| {
            Self::require_caller(caller, component::VALIDATOR_SET)?;
            let points = scores.params.no_key_write_factor;
            let score = scores.apply(mining, -(points as i128), now, ledger)?;
            info!("No-key-write penalty for {}: -{} (score {})", mining, points, score);
            Ok(score)
        })
    }

    /// Penalise a validator the connectivity tracker found faulty.
    /// `faulty_for == 0` means "for the whole epoch" and costs the full factor.
    pub fn penalise_bad_performance(
        &mut self,
        caller: Address,
        mining: Address,
        faulty_for: u64,
        now: Timestamp,
        ledger: &mut StakeLedger,
    ) -> Result<u64, BonusScoreError> {
        self.non_reentrant(|scores| {
            Self::require_caller(caller, component::CONNECTIVITY_TRACKER)?;
            let factor = scores.params.bad_performance_factor;
            let points = if faulty_for == 0 {
                factor
            } else {
                (faulty_for / scores.time_per_point(factor)).min(factor)
            };
            if points == 0 {
                return Ok(scores.score_of(&mining));
            }
            let score = scores.apply(mining, -(points as i128), now, ledger)?;
            info!("Bad-performance penalty for {}: -{} (score {})", mining, points, score);
            Ok(score)
        })
    }

    pub fn set_param(&mut self, caller: Address, key: &str, value: ParamValue) -> Result<ParamChange, BonusScoreError> {
        Self::require_caller(caller, self.owner)?;
        Ok(BonusScoreParams::registry()?.set(&mut self.params, key, value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stake_ledger::{LedgerEnv, StakingParams};
    use posdao_core::{EpochClock, EpochSettings, FlatScore, NoValidators};

    const OWNER: Address = Address([0xaa; 20]);
    const DAY: u64 = 86_400;

    fn pool() -> (Address, Address) {
        (Address::from_low_u64(1), Address::from_low_u64(1001))
    }

    fn setup() -> (BonusScoreLedger, StakeLedger) {
        let settings = EpochSettings::new(DAY, 3600, 600).unwrap();
        let params = StakingParams { candidate_min_stake: 100, delegator_min_stake: 10 };
        let mut ledger = StakeLedger::new(params, OWNER, EpochClock::genesis(settings, 0, 0)).unwrap();
        let (staking, mining) = pool();
        ledger
            .add_pool(staking, mining, 500, &LedgerEnv::new(10, &NoValidators, &FlatScore(MIN_SCORE)))
            .unwrap();
        let scores = BonusScoreLedger::new(BonusScoreParams::default(), OWNER, DAY).unwrap();
        (scores, ledger)
    }

    #[test]
    fn test_unknown_address_starts_at_floor() {
        let (scores, _) = setup();
        assert_eq!(scores.score_of(&Address::from_low_u64(77)), MIN_SCORE);
        assert_eq!(scores.time_per_point(15), DAY / 15);
        assert_eq!(scores.time_per_point(0), DAY);
    }

    #[test]
    fn test_stand_by_is_time_proportional() {
        let (mut scores, mut ledger) = setup();
        let (staking, mining) = pool();

        let score = scores.reward_stand_by(component::VALIDATOR_SET, mining, 0, DAY, &mut ledger).unwrap();
        assert_eq!(score, MIN_SCORE + 15);
        assert_eq!(ledger.pool(&staking).unwrap().likelihood, 500 * 16);
        assert_eq!(scores.last_score_change(&mining), Some(DAY));

        // the same availability window is not paid twice
        let again = scores.reward_stand_by(component::VALIDATOR_SET, mining, 0, DAY, &mut ledger).unwrap();
        assert_eq!(again, 16);
        let half = scores.reward_stand_by(component::VALIDATOR_SET, mining, 0, DAY + DAY / 2, &mut ledger).unwrap();
        assert_eq!(half, 16 + 7);
    }

    #[test]
    fn test_penalties_clamp_at_floor() {
        let (mut scores, mut ledger) = setup();
        let (_, mining) = pool();
        scores.reward_stand_by(component::VALIDATOR_SET, mining, 0, 2 * DAY, &mut ledger).unwrap();
        assert_eq!(scores.score_of(&mining), 31);

        let s = scores.penalise_no_key_write(component::VALIDATOR_SET, mining, 2 * DAY, &mut ledger).unwrap();
        assert_eq!(s, MIN_SCORE);
        let s = scores.penalise_no_stand_by(component::VALIDATOR_SET, mining, 0, 10 * DAY, &mut ledger).unwrap();
        assert_eq!(s, MIN_SCORE);
    }

    #[test]
    fn test_bad_performance_scaled_by_faulty_time() {
        let (mut scores, mut ledger) = setup();
        let (_, mining) = pool();
        scores.reward_stand_by(component::VALIDATOR_SET, mining, 0, 20 * DAY, &mut ledger).unwrap();
        assert_eq!(scores.score_of(&mining), 301);

        let tpp = scores.time_per_point(100);
        let s = scores
            .penalise_bad_performance(component::CONNECTIVITY_TRACKER, mining, 10 * tpp, 20 * DAY, &mut ledger)
            .unwrap();
        assert_eq!(s, 291);
        let s = scores
            .penalise_bad_performance(component::CONNECTIVITY_TRACKER, mining, 0, 20 * DAY, &mut ledger)
            .unwrap();
        assert_eq!(s, 191);
    }

    #[test]
    fn test_callers_are_checked() {
        let (mut scores, mut ledger) = setup();
        let (_, mining) = pool();
        assert_eq!(
            scores.penalise_bad_performance(component::VALIDATOR_SET, mining, 0, 1, &mut ledger),
            Err(BonusScoreError::Unauthorized(component::VALIDATOR_SET))
        );
        assert_eq!(
            scores.reward_stand_by(component::CONNECTIVITY_TRACKER, mining, 0, DAY, &mut ledger),
            Err(BonusScoreError::Unauthorized(component::CONNECTIVITY_TRACKER))
        );
    }

    #[test]
    fn test_stand_by_factor_moves_one_step_at_a_time() {
        let (mut scores, _) = setup();
        scores.set_param(OWNER, BonusScoreParams::STAND_BY_FACTOR, 20).unwrap();
        assert!(matches!(
            scores.set_param(OWNER, BonusScoreParams::STAND_BY_FACTOR, 30),
            Err(BonusScoreError::Param(ParamError::StepTooLarge { .. }))
        ));
        scores.set_param(OWNER, BonusScoreParams::STAND_BY_FACTOR, 25).unwrap();
        scores.set_param(OWNER, BonusScoreParams::STAND_BY_FACTOR, 30).unwrap();
        assert_eq!(scores.params().stand_by_factor, 30);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            StandBy(u64),
            NoStandBy(u64),
            NoKeyWrite,
            BadPerformance(u64),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u64..40 * DAY).prop_map(Op::StandBy),
                (0u64..40 * DAY).prop_map(Op::NoStandBy),
                Just(Op::NoKeyWrite),
                (0u64..DAY).prop_map(Op::BadPerformance),
            ]
        }

        proptest! {
            #[test]
            fn score_stays_within_bounds(ops in prop::collection::vec(op(), 1..40)) {
                let (mut scores, mut ledger) = setup();
                let (_, mining) = pool();
                let mut now = 0u64;
                for op in ops {
                    now += DAY;
                    let score = match op {
                        Op::StandBy(back) => scores.reward_stand_by(component::VALIDATOR_SET, mining, now.saturating_sub(back), now, &mut ledger),
                        Op::NoStandBy(back) => scores.penalise_no_stand_by(component::VALIDATOR_SET, mining, now.saturating_sub(back), now, &mut ledger),
                        Op::NoKeyWrite => scores.penalise_no_key_write(component::VALIDATOR_SET, mining, now, &mut ledger),
                        Op::BadPerformance(t) => scores.penalise_bad_performance(component::CONNECTIVITY_TRACKER, mining, t, now, &mut ledger),
                    }.unwrap();
                    prop_assert!((MIN_SCORE..=MAX_SCORE).contains(&score));
                    prop_assert_eq!(score, scores.score_of(&mining));
                }
            }
        }
    }
}
