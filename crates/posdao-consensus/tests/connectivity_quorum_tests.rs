/// CONNECTIVITY QUORUM PROPERTY TESTS
///
/// A target is faulty exactly when more than floor(2 * (n - 1) / 3) of the
/// other validators report it, whatever the committee size and report order.

#[cfg(test)]
mod connectivity_quorum_tests {
    use posdao_consensus::*;
    use posdao_core::{Address, BlockContext, BlockHash};
    use proptest::prelude::*;

    fn chain(head: u64) -> BlockHistory {
        let mut history = BlockHistory::new();
        for n in 1..=head {
            history.push(&BlockContext::synthetic(n, n * 5));
        }
        history
    }

    proptest! {
        #[test]
        fn faulty_iff_reports_exceed_two_thirds(n in 2usize..=25, reports in 0usize..25, shift in 0usize..25) {
            let reports = reports.min(n - 1);
            let set: Vec<Address> = (1..=n as u64).map(Address::from_low_u64).collect();
            let target = set[0];
            let others: Vec<Address> = set[1..].to_vec();
            let history = chain(20);
            let env = ReportEnv { epoch: 3, epoch_start_block: 1, now: 100, history: &history, validators: &set };

            let mut tracker = ConnectivityTracker::new(ConnectivityParams::default(), Address::from_low_u64(999)).unwrap();
            for k in 0..reports {
                let reporter = others[(k + shift) % others.len()];
                tracker.report_missing_connectivity(reporter, target, 20, BlockHash::for_number(20), &env).unwrap();
            }
            prop_assert_eq!(tracker.connectivity_score(3, &target), reports);
            prop_assert_eq!(tracker.is_faulty(3, &target), reports > 2 * (n - 1) / 3);
            prop_assert_eq!(fault_quorum(n), 2 * (n - 1) / 3);
        }

        #[test]
        fn reconnect_undoes_fault(n in 4usize..=25) {
            let set: Vec<Address> = (1..=n as u64).map(Address::from_low_u64).collect();
            let history = chain(20);
            let env = ReportEnv { epoch: 0, epoch_start_block: 1, now: 100, history: &history, validators: &set };
            let mut tracker = ConnectivityTracker::new(ConnectivityParams::default(), Address::from_low_u64(999)).unwrap();

            let needed = fault_quorum(n) + 1;
            for reporter in &set[1..=needed] {
                tracker.report_missing_connectivity(*reporter, set[0], 15, BlockHash::for_number(15), &env).unwrap();
            }
            prop_assert!(tracker.is_faulty(0, &set[0]));
            let outcome = tracker.report_reconnect(set[1], set[0], 15, BlockHash::for_number(15), &env).unwrap();
            prop_assert!(outcome.recovered);
            prop_assert!(!tracker.is_faulty(0, &set[0]));
            prop_assert_eq!(tracker.flagged_validators(0), vec![set[0]]);
        }
    }
}
