//! Shared setup for the simulation suite.

use scx_ctrl::policy::{CtrlPolicy, PolicyConfig, SchedMode};
use scx_ctrl::sim::{SimConfig, SimReport, SimRunner};
use scx_ctrl::workload::Scenario;

pub const MS: u64 = 1_000_000;
pub const SEC: u64 = 1_000_000_000;

pub fn fifo() -> PolicyConfig {
    PolicyConfig {
        mode: SchedMode::Fifo,
        ..PolicyConfig::default()
    }
}

pub fn control() -> PolicyConfig {
    PolicyConfig {
        control: true,
        ..PolicyConfig::default()
    }
}

pub fn run_with(policy: &CtrlPolicy, scenario: Scenario) -> SimReport {
    let runner = SimRunner::new(scenario, SimConfig::default()).expect("valid scenario");
    match runner.run(policy).into_result() {
        Ok(report) => report,
        Err(fail) => panic!("{:?} at t={}: {}", fail.kind, fail.t_ns, fail.message),
    }
}

pub fn run(scenario: Scenario, cfg: PolicyConfig) -> SimReport {
    let policy = CtrlPolicy::new(cfg, scenario.nr_cpus).expect("valid config");
    run_with(&policy, scenario)
}
