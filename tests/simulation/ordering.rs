//! FIFO and vtime ordering are mutually exclusive modes of the shared queue.

use std::sync::Arc;

use scx_ctrl::dsq::{DsqKind, SHARED_DSQ};
use scx_ctrl::host::Host;
use scx_ctrl::policy::{CtrlPolicy, PolicyConfig, SchedulingPolicy};
use scx_ctrl::sim::SimHost;
use scx_ctrl::task::{CpuId, Task};
use scx_ctrl::workload::{Scenario, TaskSpec};

use crate::support::{fifo, run, SEC};

fn weighted_hogs() -> Scenario {
    Scenario::new(1, 3 * SEC)
        .with_task(TaskSpec::hog(1, 100))
        .with_task(TaskSpec::hog(2, 200))
        .with_task(TaskSpec::hog(3, 300))
}

#[test]
fn shared_queue_kind_follows_mode() {
    for (cfg, kind) in [
        (PolicyConfig::default(), DsqKind::Vtime),
        (fifo(), DsqKind::Fifo),
    ] {
        let host = SimHost::new(2);
        let policy = CtrlPolicy::new(cfg, 2).unwrap();
        policy.init(&host).unwrap();
        assert_eq!(host.dsq().kind(SHARED_DSQ), Some(kind));
    }
}

#[test]
fn fifo_ignores_weights() {
    let report = run(weighted_hogs(), fifo());
    let (a, b, c) = (report.runtime(1), report.runtime(2), report.runtime(3));
    let slice = 20_000_000;
    assert!(a.abs_diff(b) <= slice && b.abs_diff(c) <= slice, "{a} {b} {c}");
    // Round robin in arrival order.
    assert_eq!(&report.dispatch_order[..6], &[1, 2, 3, 1, 2, 3]);
}

#[test]
fn vtime_shares_follow_weights() {
    let report = run(weighted_hogs(), PolicyConfig::default());
    let share = |pid| report.share(pid);
    assert!((share(1) - 1.0 / 6.0).abs() < 0.03, "pid 1 share {}", share(1));
    assert!((share(2) - 2.0 / 6.0).abs() < 0.03, "pid 2 share {}", share(2));
    assert!((share(3) - 3.0 / 6.0).abs() < 0.03, "pid 3 share {}", share(3));
}

#[test]
fn fifo_dispatches_in_arrival_order_regardless_of_vtime() {
    let host = SimHost::new(1);
    let policy = CtrlPolicy::new(fifo(), 1).unwrap();
    policy.init(&host).unwrap();

    let tasks: Vec<Arc<Task>> = (1..=3).map(|pid| Arc::new(Task::new(pid, 100))).collect();
    for (t, vtime) in tasks.iter().zip([300, 100, 200]) {
        t.set_dsq_vtime(vtime);
        policy.enqueue(&host, t, 0);
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        policy.dispatch(&host, CpuId::from_u32(0), None);
        order.push(host.dsq().pop_local(CpuId::from_u32(0)).unwrap().pid());
    }
    assert_eq!(order, vec![1, 2, 3]);
}

#[test]
fn vtime_dispatches_lowest_vtime_first() {
    let host = SimHost::new(1);
    let policy = CtrlPolicy::new(PolicyConfig::default(), 1).unwrap();
    policy.init(&host).unwrap();

    let tasks: Vec<Arc<Task>> = (1..=3).map(|pid| Arc::new(Task::new(pid, 100))).collect();
    for (t, vtime) in tasks.iter().zip([300, 100, 200]) {
        t.set_dsq_vtime(vtime);
        policy.enqueue(&host, t, 0);
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        policy.dispatch(&host, CpuId::from_u32(0), None);
        order.push(host.dsq().pop_local(CpuId::from_u32(0)).unwrap().pid());
    }
    assert_eq!(order, vec![2, 3, 1]);
}
