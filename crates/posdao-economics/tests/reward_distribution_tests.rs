/// REWARD DISTRIBUTION INTEGRATION TESTS
///
/// These tests drive the stake ledger and the reward engine together:
/// - Validator floor + proportional split inside a pool
/// - Lazy claim walk across many epochs with gaps
/// - Claim idempotence
/// - Conservation of drained pot value

#[cfg(test)]
mod reward_distribution_tests {
    use posdao_core::{component, Address, Amount, EpochClock, EpochSettings, FlatScore, NoValidators, SYSTEM_ADDRESS};
    use posdao_economics::*;

    const OWNER: Address = Address([0xaa; 20]);
    const DURATION: u64 = 1000;

    static UNIT_SCORE: FlatScore = FlatScore(1);
    static NO_VALIDATORS: NoValidators = NoValidators;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn staking(n: u64) -> Address {
        Address::from_low_u64(n)
    }

    fn mining(n: u64) -> Address {
        Address::from_low_u64(1000 + n)
    }

    fn new_ledger() -> StakeLedger {
        let settings = EpochSettings::new(DURATION, 200, 100).unwrap();
        let params = StakingParams { candidate_min_stake: 100, delegator_min_stake: 10 };
        StakeLedger::new(params, OWNER, EpochClock::genesis(settings, 0, 0)).unwrap()
    }

    fn env(ledger: &StakeLedger) -> LedgerEnv<'static> {
        LedgerEnv::new(ledger.clock().start_time + 10, &NO_VALIDATORS, &UNIT_SCORE)
    }

    /// Start the next epoch and snapshot the given validator pools.
    fn advance(ledger: &mut StakeLedger, validators: &[Address]) {
        let start = ledger.clock().end_time();
        let epoch = ledger.begin_epoch(component::VALIDATOR_SET, start, 0).unwrap();
        ledger.snapshot_pool_stakes(component::VALIDATOR_SET, epoch, validators).unwrap();
    }

    fn single_validator_engine(pot: Amount) -> RewardEngine {
        let params = RewardParams { max_validators: 1, ..RewardParams::default() };
        let mut engine = RewardEngine::new(params, OWNER).unwrap();
        engine.add_to_delta_pot(pot).unwrap();
        engine
    }

    fn close_epoch(engine: &mut RewardEngine, ledger: &mut StakeLedger, validators: &[Address]) -> Amount {
        let input = EpochRewardInput {
            epoch: ledger.staking_epoch(),
            epoch_start: ledger.clock().start_time,
            target_duration: DURATION,
            now: ledger.clock().end_time(),
            validators: validators.to_vec(),
        };
        engine.reward(SYSTEM_ADDRESS, true, &input, ledger, &NoValidators).unwrap()
    }

    #[test]
    fn test_validator_floor_then_delegators() {
        init_logging();
        let mut ledger = new_ledger();
        let mut engine = single_validator_engine(10_000);

        for _ in 0..4 {
            advance(&mut ledger, &[]);
        }
        let e = env(&ledger);
        ledger.add_pool(staking(1), mining(1), 100, &e).unwrap();
        ledger.stake(staking(1), staking(2), 50, &e).unwrap();
        advance(&mut ledger, &[staking(1)]);
        assert_eq!(ledger.staking_epoch(), 5);

        // 10% of 10_000 with one of one validators, no governance address
        let minted = close_epoch(&mut engine, &mut ledger, &[mining(1)]);
        assert_eq!(minted, 1000);
        advance(&mut ledger, &[staking(1)]);

        let e = env(&ledger);
        let validator = ledger.claim_reward(&[], staking(1), staking(1), &e).unwrap();
        let delegator = ledger.claim_reward(&[], staking(1), staking(2), &e).unwrap();
        assert_eq!(validator, 766);
        assert_eq!(delegator, 233);
    }

    #[test]
    fn test_lazy_walk_covers_long_dormancy() {
        init_logging();
        let mut ledger = new_ledger();
        let mut engine = single_validator_engine(1_000_000_000);

        let e = env(&ledger);
        ledger.add_pool(staking(1), mining(1), 300, &e).unwrap();
        ledger.stake(staking(1), staking(2), 100, &e).unwrap();

        let mut expected = 0u128;
        for epoch in 1..=40u64 {
            // the pool validates in every epoch not divisible by 3
            let validating = epoch % 3 != 0;
            let pools = if validating { vec![staking(1)] } else { Vec::new() };
            advance(&mut ledger, &pools);
            if validating {
                close_epoch(&mut engine, &mut ledger, &[mining(1)]);
                let booked = ledger.epoch_pool_reward(&staking(1), epoch).unwrap();
                expected += booked.delegator_share(100);
            }
        }
        advance(&mut ledger, &[]);

        let e = env(&ledger);
        assert_eq!(ledger.pending_reward(&staking(1), &staking(2)), expected);
        assert_eq!(ledger.claim_reward(&[], staking(1), staking(2), &e).unwrap(), expected);
        assert_eq!(ledger.claim_reward(&[], staking(1), staking(2), &e).unwrap(), 0);

        let position = ledger.position(&staking(1), &staking(2)).unwrap();
        assert_eq!(position.claim_cursor, ledger.staking_epoch());
        assert_eq!(position.history.len(), 1);
    }

    #[test]
    fn test_explicit_then_walk_does_not_double_pay() {
        let mut ledger = new_ledger();
        let mut engine = single_validator_engine(1_000_000);

        let e = env(&ledger);
        ledger.add_pool(staking(1), mining(1), 100, &e).unwrap();
        for _ in 0..3 {
            advance(&mut ledger, &[staking(1)]);
            close_epoch(&mut engine, &mut ledger, &[mining(1)]);
        }
        advance(&mut ledger, &[]);

        let e = env(&ledger);
        let first = ledger.claim_reward(&[2, 2], staking(1), staking(1), &e).unwrap();
        assert_eq!(first, ledger.epoch_pool_reward(&staking(1), 2).unwrap().reward);
        let rest = ledger.claim_reward(&[], staking(1), staking(1), &e).unwrap();
        let total: Amount = (1..=3).map(|ep| ledger.epoch_pool_reward(&staking(1), ep).unwrap().reward).sum();
        assert_eq!(first + rest, total);
        assert_eq!(ledger.claim_reward(&[1, 2, 3], staking(1), staking(1), &e).unwrap(), 0);
    }

    #[test]
    fn test_stake_changes_count_from_next_epoch() {
        let mut ledger = new_ledger();
        let mut engine = single_validator_engine(1_000_000);

        let e = env(&ledger);
        ledger.add_pool(staking(1), mining(1), 100, &e).unwrap();
        advance(&mut ledger, &[staking(1)]);

        // delegation made during epoch 1 must not earn epoch 1 rewards
        let e = env(&ledger);
        ledger.stake(staking(1), staking(2), 100, &e).unwrap();
        close_epoch(&mut engine, &mut ledger, &[mining(1)]);
        advance(&mut ledger, &[staking(1)]);
        close_epoch(&mut engine, &mut ledger, &[mining(1)]);
        advance(&mut ledger, &[]);

        let e = env(&ledger);
        assert_eq!(ledger.claim_reward(&[1], staking(1), staking(2), &e).unwrap(), 0);
        let epoch2 = *ledger.epoch_pool_reward(&staking(1), 2).unwrap();
        assert_eq!(epoch2.snapshot.total_stake, 200);
        assert_eq!(ledger.claim_reward(&[2], staking(1), staking(2), &e).unwrap(), epoch2.delegator_share(100));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn pot_value_is_conserved(
                validators in 1u64..8,
                pot in 1u128..1_000_000_000_000,
                reinsert in 0u128..1_000_000,
                elapsed in 1u64..3 * DURATION,
                banned_mask in 0u8..=255,
            ) {
                let mut ledger = new_ledger();
                let e = env(&ledger);
                for i in 1..=validators {
                    ledger.add_pool(staking(i), mining(i), 100 + i as u128, &e).unwrap();
                    ledger.stake(staking(i), staking(100 + i), 10 * i as u128, &e).unwrap();
                }
                let pools: Vec<Address> = (1..=validators).map(staking).collect();
                advance(&mut ledger, &pools);

                let params = RewardParams {
                    governance_address: Address([0xbb; 20]),
                    max_validators: 7,
                    ..RewardParams::default()
                };
                let mut engine = RewardEngine::new(params, OWNER).unwrap();
                engine.add_to_delta_pot(pot).unwrap();
                if reinsert > 0 {
                    engine.add_to_reinsert_pot(reinsert).unwrap();
                }

                struct Mask(u8);
                impl posdao_core::ValidatorStatus for Mask {
                    fn is_validator_or_pending(&self, _: &Address) -> bool { true }
                    fn is_banned(&self, m: &Address, _: u64) -> bool {
                        let idx = (m.0[19] as u64 + ((m.0[18] as u64) << 8)) - 1000;
                        self.0 & (1 << (idx % 8)) != 0
                    }
                }

                let before = engine.pots().total();
                let input = EpochRewardInput {
                    epoch: 1,
                    epoch_start: ledger.clock().start_time,
                    target_duration: DURATION,
                    now: ledger.clock().start_time + elapsed,
                    validators: (1..=validators).map(mining).collect(),
                };
                let minted = engine.reward(SYSTEM_ADDRESS, true, &input, &mut ledger, &Mask(banned_mask)).unwrap();
                let summary = engine.epoch_reward_summary(1).unwrap().clone();

                prop_assert_eq!(
                    summary.delta_drained + summary.reinsert_drained + summary.carried_in,
                    minted + summary.carried_out
                );
                prop_assert_eq!(before, engine.pots().total() + minted);
                prop_assert!(summary.epoch_percentage <= 100);

                advance(&mut ledger, &[]);
                let e = env(&ledger);
                let mut claimed = 0u128;
                let mut stakers = 0u128;
                for i in 1..=validators {
                    claimed += ledger.claim_reward(&[], staking(i), staking(i), &e).unwrap();
                    claimed += ledger.claim_reward(&[], staking(i), staking(100 + i), &e).unwrap();
                    stakers += 2;
                }
                let booked = minted - summary.governance_share;
                prop_assert!(claimed <= booked);
                prop_assert!(booked - claimed <= stakers);
                prop_assert_eq!(ledger.reward_reserve(), booked - claimed);
            }

            #[test]
            fn second_claim_pays_nothing(epochs in prop::collection::vec(1u64..6, 0..6)) {
                let mut ledger = new_ledger();
                let mut engine = single_validator_engine(1_000_000);
                let e = env(&ledger);
                ledger.add_pool(staking(1), mining(1), 100, &e).unwrap();
                ledger.stake(staking(1), staking(2), 40, &e).unwrap();
                for _ in 0..5 {
                    advance(&mut ledger, &[staking(1)]);
                    close_epoch(&mut engine, &mut ledger, &[mining(1)]);
                }
                advance(&mut ledger, &[]);

                let e = env(&ledger);
                ledger.claim_reward(&epochs, staking(1), staking(2), &e).unwrap();
                prop_assert_eq!(ledger.claim_reward(&epochs, staking(1), staking(2), &e).unwrap(), 0);
                ledger.claim_reward(&[], staking(1), staking(2), &e).unwrap();
                prop_assert_eq!(ledger.claim_reward(&[], staking(1), staking(2), &e).unwrap(), 0);
                prop_assert_eq!(ledger.claim_reward(&[1, 2, 3, 4, 5], staking(1), staking(2), &e).unwrap(), 0);
            }
        }
    }
}
