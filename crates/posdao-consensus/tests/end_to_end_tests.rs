/// END TO END TESTS
///
/// Start the engine from a JSON config and run it the way a consensus
/// driver would: one locked `on_block` per block, stakers acting between
/// blocks, rewards claimed after the epoch closes.

#[cfg(test)]
mod end_to_end_tests {
    use posdao_consensus::*;
    use posdao_core::{Address, BlockContext, Timestamp, SYSTEM_ADDRESS};
    use posdao_economics::StakingError;

    const CONFIG: &str = r#"{
        "epoch": { "fixed_duration": 1000, "transition_window": 200, "withdraw_disallow_period": 100 },
        "staking": { "candidate_min_stake": 100, "delegator_min_stake": 10 },
        "reward": {
            "governance_address": "0x0000000000000000000000000000000000000000",
            "governance_pot_share_percent": 10,
            "delta_pot_payout_percent": 10,
            "reinsert_pot_payout_percent": 10,
            "validator_min_reward_percent": 30,
            "max_validators": 1
        },
        "owner": "0x00000000000000000000000000000000000000aa",
        "misbehavior_oracle": "0x00000000000000000000000000000000000000cc",
        "genesis_validators": [
            {
                "staking": "0x0000000000000000000000000000000000000001",
                "mining": "0x00000000000000000000000000000000000003e9",
                "stake": 100
            }
        ]
    }"#;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn pool() -> Address {
        Address::from_low_u64(1)
    }

    fn delegator() -> Address {
        Address::from_low_u64(50)
    }

    fn start_engine(json: &str, genesis: BlockContext) -> Result<SharedEngine, EngineError> {
        let config = EngineConfig::from_json(json)?;
        Ok(EpochEngine::genesis(config, genesis)?.into_shared())
    }

    fn start() -> SharedEngine {
        start_engine(CONFIG, BlockContext::synthetic(0, 0)).unwrap()
    }

    fn run_until(shared: &SharedEngine, until: Timestamp) -> Vec<BlockOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let mut engine = shared.lock();
            if engine.now() + 10 > until {
                break;
            }
            let ctx = BlockContext::synthetic(engine.head() + 1, engine.now() + 10);
            outcomes.push(engine.on_block(SYSTEM_ADDRESS, ctx, &InstantKeyGen).unwrap());
        }
        outcomes
    }

    #[test]
    fn test_engine_starts_from_json() {
        init_logging();
        let shared = start();
        let engine = shared.lock();
        assert_eq!(engine.staking_epoch(), 0);
        assert_eq!(engine.phase(), EpochPhase::Regular);
        assert_eq!(engine.current_validators(), &[Address::from_low_u64(1001)][..]);
        assert_eq!(engine.mining_by_staking(&pool()), Some(Address::from_low_u64(1001)));
        assert_eq!(engine.epoch_end_time(), 1000);
        engine.verify_invariants().unwrap();
    }

    #[test]
    fn test_malformed_config_is_rejected() {
        assert!(matches!(
            start_engine("{ \"owner\": 7 }", BlockContext::synthetic(0, 0)),
            Err(EngineError::Config(_))
        ));
        let no_validators = r#"{ "genesis_validators": [] }"#;
        assert!(matches!(
            start_engine(no_validators, BlockContext::synthetic(0, 0)),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_delegator_claims_split_reward() {
        init_logging();
        let shared = start();
        run_until(&shared, 10);
        shared.lock().stake(delegator(), pool(), 50).unwrap();

        // epoch 0 runs with an empty pot
        let outcomes = run_until(&shared, 1000);
        assert_eq!(outcomes.last().unwrap().finalized, Some(1));
        assert_eq!(outcomes.last().unwrap().minted, 0);

        // one validator with max_validators = 1 drains the full 10%
        shared.lock().add_to_delta_pot(10_000).unwrap();
        let outcomes = run_until(&shared, 2000);
        assert_eq!(outcomes.last().unwrap().finalized, Some(2));
        assert_eq!(outcomes.last().unwrap().minted, 1_000);

        let mut engine = shared.lock();
        assert_eq!(engine.economics().stake.pending_reward(&pool(), &delegator()), 233);

        // floor 300, then 700 split 100:50
        assert_eq!(engine.claim_reward(pool(), pool(), &[]).unwrap(), 766);
        assert_eq!(engine.claim_reward(delegator(), pool(), &[]).unwrap(), 233);
        assert_eq!(engine.claim_reward(delegator(), pool(), &[]).unwrap(), 0);
        assert_eq!(engine.claim_reward(delegator(), pool(), &[1]).unwrap(), 0);
        assert_eq!(engine.economics().stake.reward_reserve(), 1);
        engine.verify_invariants().unwrap();
    }

    #[test]
    fn test_ordered_withdrawal_matures_next_epoch() {
        let shared = start();
        run_until(&shared, 10);
        shared.lock().stake(delegator(), pool(), 50).unwrap();
        run_until(&shared, 1010);

        {
            let mut engine = shared.lock();
            assert_eq!(engine.staking_epoch(), 1);
            // stake from an earlier epoch in a validator pool must be ordered
            assert_eq!(engine.max_withdraw_allowed(&delegator(), &pool()), 0);
            assert_eq!(engine.max_withdraw_order_allowed(&delegator(), &pool()), 50);
            engine.order_withdraw(delegator(), pool(), 50).unwrap();
            assert!(matches!(
                engine.claim_ordered_withdraw(delegator(), pool()),
                Err(EngineError::Staking(StakingError::OrderNotMatured { ordered_epoch: 1 }))
            ));
        }

        run_until(&shared, 2010);
        let mut engine = shared.lock();
        assert_eq!(engine.staking_epoch(), 2);
        assert_eq!(engine.claim_ordered_withdraw(delegator(), pool()).unwrap(), 50);
        assert!(engine.economics().stake.snapshot(&pool(), 2).is_some());
        engine.verify_invariants().unwrap();
    }
}
