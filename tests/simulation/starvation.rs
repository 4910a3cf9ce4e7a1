//! Every runnable task eventually runs, in every mode.

use scx_ctrl::task::DEFAULT_WEIGHT;
use scx_ctrl::workload::{ControlAction, Scenario, TaskSpec};

use crate::support::{control, fifo, run, MS, SEC};

fn mixed(nr_cpus: usize) -> Scenario {
    let mut s = Scenario::new(nr_cpus, 2 * SEC);
    for i in 0..6 {
        s = s.with_task(TaskSpec::hog(100 + i, DEFAULT_WEIGHT));
    }
    for i in 0..4 {
        s = s.with_task(TaskSpec::interactive(200 + i, MS, 5 * MS).starting_at(u64::from(i) * MS));
    }
    s.with_task(TaskSpec::hog(300, 1)).with_task(TaskSpec::hog(301, 5000))
}

fn assert_everyone_ran(scenario: &Scenario, report: &scx_ctrl::sim::SimReport) {
    for t in &scenario.tasks {
        assert!(report.runtime(t.pid) > 0, "pid {} never ran", t.pid);
    }
}

#[test]
fn vtime_mode_serves_every_task() {
    for nr_cpus in [1, 2, 4] {
        let s = mixed(nr_cpus);
        let report = run(s.clone(), Default::default());
        assert_everyone_ran(&s, &report);
    }
}

#[test]
fn fifo_mode_serves_every_task() {
    let s = mixed(2);
    let report = run(s.clone(), fifo());
    assert_everyone_ran(&s, &report);
}

#[test]
fn stopped_tasks_are_slowed_not_starved() {
    let mut s = mixed(2);
    for pid in 100..106 {
        s = s.with_control(0, pid, ControlAction::Set { flag: 1 });
    }
    let report = run(s.clone(), control());
    assert_everyone_ran(&s, &report);
    assert!(report.stats.expect("policy stats").throttled > 0);
}

#[test]
fn long_sleeper_is_not_starved_by_hogs() {
    let s = Scenario::new(1, 2 * SEC)
        .with_task(TaskSpec::hog(1, DEFAULT_WEIGHT))
        .with_task(TaskSpec::hog(2, DEFAULT_WEIGHT))
        .with_task(TaskSpec::interactive(3, 2 * MS, 500 * MS));
    let report = run(s, Default::default());
    // Four wakeups in two seconds, each served.
    assert!(report.runs[&3] >= 3, "sleeper ran {} times", report.runs[&3]);
}
