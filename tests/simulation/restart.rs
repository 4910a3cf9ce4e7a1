//! Restart handshake: a fresh policy instance on a shared control table
//! behaves exactly like the first one.

use std::sync::Arc;

use scx_ctrl::ctrl_table::{ProcessControlTable, FLAG_STOPPED};
use scx_ctrl::dsq::{DsqKind, SHARED_DSQ, THROTTLE_DSQ};
use scx_ctrl::host::Host;
use scx_ctrl::policy::{
    CtrlPolicy, ExitInfo, ExitKind, SchedulingPolicy, SCX_ECODE_ACT_RESTART, SCX_ECODE_RSN_HOTPLUG,
};
use scx_ctrl::sim::SimHost;
use scx_ctrl::workload::{Scenario, TaskSpec};

use crate::support::{control, run_with, MS, SEC};

fn scenario() -> Scenario {
    Scenario::new(2, SEC)
        .with_task(TaskSpec::hog(10, 100))
        .with_task(TaskSpec::hog(11, 300))
        .with_task(TaskSpec::hog(12, 100))
        .with_task(TaskSpec::interactive(13, MS, 3 * MS))
}

#[test]
fn reattach_reproduces_the_same_schedule() {
    let table = Arc::new(ProcessControlTable::new(16));
    table.set(12, FLAG_STOPPED).unwrap();

    let first = CtrlPolicy::with_control_table(control(), 2, Arc::clone(&table)).unwrap();
    let a = run_with(&first, scenario());
    assert!(first.has_exited());

    let second = CtrlPolicy::with_control_table(control(), 2, Arc::clone(&table)).unwrap();
    let b = run_with(&second, scenario());

    assert_eq!(a.dispatch_order, b.dispatch_order);
    assert_eq!(a.runtime_ns, b.runtime_ns);
    assert_eq!(a.stats, b.stats);
    assert_eq!(table.len(), 1, "controller state survives the restart");
}

#[test]
fn restart_request_is_carried_by_the_exit_code() {
    let restart = ExitInfo::new(ExitKind::UnregKern)
        .with_code((SCX_ECODE_ACT_RESTART | SCX_ECODE_RSN_HOTPLUG) as i64);
    assert!(restart.should_restart());
    assert!(!ExitInfo::new(ExitKind::Unreg).should_restart());
    assert!(!ExitInfo::new(ExitKind::ErrorStall).should_restart());
}

#[test]
fn first_recorded_exit_wins() {
    let policy = CtrlPolicy::new(control(), 1).unwrap();
    policy.exit(ExitInfo::new(ExitKind::SysRq));
    policy.exit(ExitInfo::new(ExitKind::Unreg));
    assert_eq!(policy.exit_info().map(|e| e.kind), Some(ExitKind::SysRq));
}

#[test]
fn init_on_a_live_host_reuses_matching_queues() {
    let host = SimHost::new(2);
    let first = CtrlPolicy::new(control(), 2).unwrap();
    first.init(&host).unwrap();
    let second = CtrlPolicy::new(control(), 2).unwrap();
    second.init(&host).unwrap();
    assert_eq!(host.dsq().kind(SHARED_DSQ), Some(DsqKind::Vtime));
    assert_eq!(host.dsq().kind(THROTTLE_DSQ), Some(DsqKind::Vtime));
}
