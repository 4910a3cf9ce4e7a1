//! Weighted entitlement.

use std::sync::Arc;

use scx_ctrl::policy::{CtrlPolicy, PolicyConfig, SchedulingPolicy, SCX_SLICE_DFL};
use scx_ctrl::sim::SimHost;
use scx_ctrl::task::Task;
use scx_ctrl::workload::{Scenario, TaskSpec};

use crate::support::{run, SEC};

#[test]
fn weight_two_gets_twice_the_cpu_of_weight_one() {
    let s = Scenario::new(1, 3 * SEC)
        .with_task(TaskSpec::hog(1, 1))
        .with_task(TaskSpec::hog(2, 2));
    let report = run(s, PolicyConfig::default());
    let share = report.share(2);
    assert!((share - 2.0 / 3.0).abs() < 0.03, "weight-2 share {share}");
    assert_eq!(report.runtime(1) + report.runtime(2), 3 * SEC);
}

#[test]
fn charge_is_inverse_to_weight() {
    let policy = CtrlPolicy::new(PolicyConfig::default(), 1).unwrap();
    let light = Task::new(1, 1);
    let heavy = Task::new(2, 2);
    for t in [&light, &heavy] {
        t.set_dsq_vtime(0);
        t.set_slice(0);
        policy.stopping(t, true);
    }
    assert_eq!(light.dsq_vtime(), SCX_SLICE_DFL * 100);
    assert_eq!(heavy.dsq_vtime(), SCX_SLICE_DFL * 50);
}

#[test]
fn sleeper_lags_at_most_one_slice() {
    let host = SimHost::new(1);
    let policy = CtrlPolicy::new(PolicyConfig::default(), 1).unwrap();
    policy.init(&host).unwrap();

    let runner = Task::new(1, 100);
    runner.set_dsq_vtime(10 * SCX_SLICE_DFL);
    policy.running(&runner);
    assert_eq!(policy.clock().read(), 10 * SCX_SLICE_DFL);

    let sleeper = Arc::new(Task::new(2, 100));
    sleeper.set_dsq_vtime(0);
    policy.enqueue(&host, &sleeper, 0);
    assert_eq!(sleeper.dsq_vtime(), 9 * SCX_SLICE_DFL);

    // A task already within budget keeps its own vtime.
    let recent = Arc::new(Task::new(3, 100));
    recent.set_dsq_vtime(10 * SCX_SLICE_DFL - 5);
    policy.enqueue(&host, &recent, 0);
    assert_eq!(recent.dsq_vtime(), 10 * SCX_SLICE_DFL - 5);
}
