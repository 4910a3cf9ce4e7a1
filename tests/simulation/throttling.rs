//! Control-table throttling end to end.

use scx_ctrl::ctrl_table::{ControlState, FLAG_RUNNING, FLAG_STOPPED};
use scx_ctrl::policy::{CtrlPolicy, PolicyConfig, THROTTLED_SLICE};
use scx_ctrl::sim::TraceEvent;
use scx_ctrl::task::DEFAULT_WEIGHT;
use scx_ctrl::workload::{ControlAction, Scenario, TaskSpec};

use crate::support::{control, run, run_with, SEC};

fn two_hogs() -> Scenario {
    Scenario::new(1, 2 * SEC)
        .with_task(TaskSpec::hog(1, DEFAULT_WEIGHT))
        .with_task(TaskSpec::hog(2, DEFAULT_WEIGHT))
}

#[test]
fn stopped_process_gets_strictly_less_cpu() {
    let s = two_hogs().with_control(0, 2, ControlAction::Set { flag: FLAG_STOPPED });
    let report = run(s, control());
    let (running, stopped) = (report.runtime(1), report.runtime(2));
    assert!(stopped > 0, "stopped task starved");
    assert!(stopped * 4 < running, "running={running} stopped={stopped}");
}

#[test]
fn stopped_process_runs_in_short_slices() {
    let s = two_hogs().with_control(0, 2, ControlAction::Set { flag: FLAG_STOPPED });
    let report = run(s, control());
    let long_runs = report
        .trace
        .iter()
        .filter(|e| matches!(e, TraceEvent::Run { pid: 2, slice, .. } if *slice > THROTTLED_SLICE))
        .count();
    // Only the very first placement, before the first enqueue, may use the
    // default slice.
    assert!(long_runs <= 1, "{long_runs} full slices while stopped");
}

#[test]
fn control_is_ignored_without_the_control_variant() {
    let s = two_hogs().with_control(0, 2, ControlAction::Set { flag: FLAG_STOPPED });
    let report = run(s, PolicyConfig::default());
    assert!(report.runtime(1).abs_diff(report.runtime(2)) <= 20_000_000);
    assert_eq!(report.stats.unwrap().throttled, 0);
}

#[test]
fn marking_running_again_restores_share() {
    let s = Scenario::new(1, 4 * SEC)
        .with_task(TaskSpec::hog(1, DEFAULT_WEIGHT))
        .with_task(TaskSpec::hog(2, DEFAULT_WEIGHT))
        .with_control(0, 2, ControlAction::Set { flag: FLAG_STOPPED })
        .with_control(2 * SEC, 2, ControlAction::Set { flag: FLAG_RUNNING });
    let policy = CtrlPolicy::new(control(), 1).unwrap();
    let report = run_with(&policy, s);

    assert_eq!(policy.control_table().get(2), ControlState::Running);
    // Half the time throttled, half at an equal share: well above the
    // throttled rate but below an equal split.
    let share = report.share(2);
    assert!(share > 0.2 && share < 0.5, "share {share}");
}

#[test]
fn clearing_the_entry_untracks_the_pid() {
    let s = two_hogs()
        .with_control(0, 2, ControlAction::Set { flag: FLAG_STOPPED })
        .with_control(SEC / 2, 2, ControlAction::Clear);
    let policy = CtrlPolicy::new(control(), 1).unwrap();
    run_with(&policy, s);
    assert_eq!(policy.control_table().get(2), ControlState::NotTracked);
    assert!(policy.control_table().is_empty());
}
