//! Shared helpers for unit tests.

use crate::policy::{CtrlPolicy, PolicyConfig};
use crate::sim::{SimConfig, SimReport, SimRunner};
use crate::workload::Scenario;

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Proptest case count: `PROPTEST_CASES` if set, `default` on CI, and at most
/// 4 locally so `cargo test` stays fast.
pub fn proptest_cases(default: u32) -> u32 {
    if let Some(n) = env_u32("PROPTEST_CASES") {
        return n.max(1);
    }
    if std::env::var_os("CI").is_some() {
        return default.max(1);
    }
    default.clamp(1, 4)
}

/// Runs `scenario` under a fresh [`CtrlPolicy`] and panics with the failure
/// report if any oracle fires.
pub fn run_policy(scenario: Scenario, cfg: PolicyConfig) -> SimReport {
    let nr_cpus = scenario.nr_cpus;
    let policy = CtrlPolicy::new(cfg, nr_cpus).expect("valid policy config");
    let runner = SimRunner::new(scenario, SimConfig::default()).expect("valid scenario");
    match runner.run(&policy).into_result() {
        Ok(report) => report,
        Err(failure) => panic!("simulation failed: {failure:?}"),
    }
}
