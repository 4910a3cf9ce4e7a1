//! Random workloads never trip a simulation oracle, in any mode.

use proptest::prelude::*;

use scx_ctrl::policy::{CtrlPolicy, PolicyConfig, SchedMode};
use scx_ctrl::sim::{SimConfig, SimRunner};
use scx_ctrl::time_before;
use scx_ctrl::workload::Scenario;

use crate::support::proptest_cases;

const DURATION_NS: u64 = 400_000_000;

fn config(fifo: bool, control: bool, drain: u32, batch: u32) -> PolicyConfig {
    PolicyConfig {
        mode: if fifo { SchedMode::Fifo } else { SchedMode::Vtime },
        control,
        throttle_drain_period: drain,
        dispatch_batch: batch,
        ..PolicyConfig::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(proptest_cases(16)))]

    #[test]
    fn random_scenarios_pass_all_oracles(
        seed in any::<u64>(),
        fifo in any::<bool>(),
        control in any::<bool>(),
        drain in 1u32..16,
        batch in 1u32..8,
    ) {
        let scenario = Scenario::random(seed, 4, 12, DURATION_NS);
        let nr_cpus = scenario.nr_cpus as u64;
        let policy =
            CtrlPolicy::new(config(fifo, control, drain, batch), scenario.nr_cpus).unwrap();
        let runner = SimRunner::new(scenario, SimConfig::default()).unwrap();

        let report = match runner.run(&policy).into_result() {
            Ok(report) => report,
            Err(fail) => {
                return Err(TestCaseError::fail(format!("{:?}: {}", fail.kind, fail.message)));
            }
        };

        let busy: u64 = report.runtime_ns.values().sum();
        prop_assert!(busy <= nr_cpus * report.end_ns);
        for pair in report.clock_samples.windows(2) {
            prop_assert!(!time_before(pair[1], pair[0]));
        }
        if !control {
            prop_assert_eq!(report.stats.unwrap().throttled, 0);
        }
    }

    #[test]
    fn runs_are_deterministic(seed in any::<u64>()) {
        let scenario = Scenario::random(seed, 3, 8, DURATION_NS / 2);
        let run = || {
            let policy = CtrlPolicy::new(config(false, true, 8, 4), scenario.nr_cpus).unwrap();
            SimRunner::new(scenario.clone(), SimConfig::default())
                .unwrap()
                .run(&policy)
                .into_result()
                .map(|r| (r.dispatch_order, r.runtime_ns))
                .map_err(|f| f.message)
        };
        prop_assert_eq!(run(), run());
    }
}
