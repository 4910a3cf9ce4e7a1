//! Threaded host: attach/detach lifecycle, watchdog, and live throttling.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use scx_ctrl::ctrl_table::FLAG_STOPPED;
use scx_ctrl::dsq::{DsqError, DsqKind, DSQ_FLAG_BUILTIN, SHARED_DSQ};
use scx_ctrl::host::{AttachError, EmuConfig, EmuHost, Host};
use scx_ctrl::policy::{
    CtrlPolicy, ExitInfo, ExitKind, ExitRecord, PolicyConfig, PolicyError,
    PolicyMaps, SchedulingPolicy, SCX_ECODE_ACT_RESTART,
};
use scx_ctrl::task::{CpuId, Task, DEFAULT_WEIGHT};
use scx_ctrl::time_before;
use scx_ctrl::workload::{Scenario, TaskSpec};

fn emu(nr_cpus: usize) -> EmuHost {
    EmuHost::new(EmuConfig {
        nr_cpus,
        time_dilation: 100,
        ..EmuConfig::default()
    })
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

/// Queues everything and never dispatches.
#[derive(Default)]
struct Blackhole {
    exit: ExitRecord,
}

impl SchedulingPolicy for Blackhole {
    fn name(&self) -> &'static str {
        "blackhole"
    }

    fn init(&self, host: &dyn Host) -> Result<(), PolicyError> {
        host.dsq()
            .create(SHARED_DSQ, DsqKind::Fifo)
            .map_err(|source| PolicyError::DsqCreate { id: SHARED_DSQ, source })
    }

    fn select_cpu(&self, _: &dyn Host, _: &Arc<Task>, prev_cpu: CpuId, _: u64) -> CpuId {
        prev_cpu
    }

    fn enqueue(&self, host: &dyn Host, task: &Arc<Task>, _: u64) {
        host.dsq().insert(SHARED_DSQ, task, None, 1_000_000);
    }

    fn dispatch(&self, _: &dyn Host, _: CpuId, _: Option<&Arc<Task>>) {}
    fn running(&self, _: &Task) {}
    fn stopping(&self, _: &Task, _: bool) {}
    fn enable(&self, _: &Task) {}

    fn exit(&self, info: ExitInfo) {
        self.exit.record(info);
    }

    fn maps(&self) -> PolicyMaps<'_> {
        PolicyMaps {
            exit: &self.exit,
            stats: None,
            control: None,
            vtime: None,
        }
    }
}

/// Rejects every attach.
#[derive(Default)]
struct BrokenInit(Blackhole);

impl SchedulingPolicy for BrokenInit {
    fn name(&self) -> &'static str {
        "broken-init"
    }
    fn init(&self, host: &dyn Host) -> Result<(), PolicyError> {
        let id = DSQ_FLAG_BUILTIN | 1;
        host.dsq()
            .create(id, DsqKind::Fifo)
            .map_err(|source| PolicyError::DsqCreate { id, source })
    }
    fn select_cpu(&self, h: &dyn Host, t: &Arc<Task>, prev: CpuId, f: u64) -> CpuId {
        self.0.select_cpu(h, t, prev, f)
    }
    fn enqueue(&self, h: &dyn Host, t: &Arc<Task>, f: u64) {
        self.0.enqueue(h, t, f)
    }
    fn dispatch(&self, h: &dyn Host, cpu: CpuId, prev: Option<&Arc<Task>>) {
        self.0.dispatch(h, cpu, prev)
    }
    fn running(&self, _: &Task) {}
    fn stopping(&self, _: &Task, _: bool) {}
    fn enable(&self, _: &Task) {}
    fn exit(&self, info: ExitInfo) {
        self.0.exit(info)
    }
    fn maps(&self) -> PolicyMaps<'_> {
        self.0.maps()
    }
}

#[test]
fn runs_builtin_workload_and_detaches_cleanly() {
    let host = emu(2);
    let policy = Arc::new(CtrlPolicy::new(PolicyConfig::default(), 2).unwrap());
    let scenario = Scenario::builtin(2, &[]);
    let handle = host.attach(policy.clone(), &scenario).unwrap();
    assert!(host.is_active());

    let mut last = policy.clock().read();
    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        let now = policy.clock().read();
        assert!(!time_before(now, last), "clock moved back: {last} -> {now}");
        last = now;
        thread::sleep(Duration::from_millis(1));
    }

    let runtime = handle.runtime_ns();
    assert_eq!(handle.placement_violations(), 0);
    assert_eq!(handle.misroutes(), 0);
    assert_eq!(handle.double_inserts(), 0);
    let info = handle.detach();

    assert_eq!(info.kind, ExitKind::Unreg);
    assert!(!host.is_active());
    for t in &scenario.tasks {
        assert!(runtime[&t.pid] > 0, "pid {} never ran", t.pid);
    }
    let stats = policy.stats().snapshot();
    assert!(stats.local + stats.global > 0);
}

#[test]
fn second_attach_is_rejected_until_detach() {
    let host = emu(1);
    let scenario = Scenario::new(1, 0).with_task(TaskSpec::hog(1, DEFAULT_WEIGHT));
    let first = host
        .attach(Arc::new(CtrlPolicy::new(PolicyConfig::default(), 1).unwrap()), &scenario)
        .unwrap();

    let other = Arc::new(CtrlPolicy::new(PolicyConfig::default(), 1).unwrap());
    let second = host.attach(other, &scenario);
    assert!(matches!(second, Err(AttachError::AlreadyActive)));

    first.detach();
    let third = host
        .attach(Arc::new(CtrlPolicy::new(PolicyConfig::default(), 1).unwrap()), &scenario)
        .unwrap();
    drop(third);
    assert!(!host.is_active());
}

#[test]
fn failed_init_does_not_attach() {
    let host = emu(1);
    let scenario = Scenario::new(1, 0).with_task(TaskSpec::hog(1, DEFAULT_WEIGHT));
    let err = host
        .attach(Arc::new(BrokenInit::default()), &scenario)
        .unwrap_err();
    assert!(matches!(
        err,
        AttachError::Init(PolicyError::DsqCreate {
            source: DsqError::Reserved { .. },
            ..
        })
    ));
    assert!(!host.is_active());
}

#[test]
fn requested_exit_stops_the_attachment() {
    let host = emu(2);
    let policy = Arc::new(CtrlPolicy::new(PolicyConfig::default(), 2).unwrap());
    let handle = host.attach(policy, &Scenario::builtin(2, &[])).unwrap();
    thread::sleep(Duration::from_millis(50));

    handle.request_exit(ExitInfo::new(ExitKind::UnregKern).with_code(SCX_ECODE_ACT_RESTART as i64));
    assert!(handle.exited());
    let info = handle.detach();
    assert_eq!(info.kind, ExitKind::UnregKern);
    assert!(info.should_restart());
}

#[test]
fn watchdog_reports_stalled_tasks() {
    let host = EmuHost::new(EmuConfig {
        nr_cpus: 1,
        watchdog_timeout: Duration::from_millis(50),
        time_dilation: 100,
        ..EmuConfig::default()
    });
    let scenario = Scenario::new(1, 0)
        .with_task(TaskSpec::hog(1, DEFAULT_WEIGHT))
        .with_task(TaskSpec::hog(2, DEFAULT_WEIGHT));
    let handle = host.attach(Arc::new(Blackhole::default()), &scenario).unwrap();

    assert!(wait_until(Duration::from_secs(5), || handle.exited()));
    let info = handle.detach();
    assert_eq!(info.kind, ExitKind::ErrorStall);
    assert!(info.kind.is_error());
    assert!(!info.should_restart());
}

#[test]
fn stopped_pid_is_throttled_live() {
    let host = emu(1);
    let cfg = PolicyConfig {
        control: true,
        ..PolicyConfig::default()
    };
    let policy = Arc::new(CtrlPolicy::new(cfg, 1).unwrap());
    policy.control_table().set(2, FLAG_STOPPED).unwrap();
    let scenario = Scenario::new(1, 0)
        .with_task(TaskSpec::hog(1, DEFAULT_WEIGHT))
        .with_task(TaskSpec::hog(2, DEFAULT_WEIGHT));

    let handle = host.attach(policy.clone(), &scenario).unwrap();
    thread::sleep(Duration::from_millis(400));
    let runtime = handle.runtime_ns();
    handle.detach();

    assert!(runtime[&2] > 0, "stopped pid starved");
    assert!(runtime[&2] * 4 < runtime[&1], "{runtime:?}");
    assert!(policy.stats().snapshot().throttled > 0);
}
