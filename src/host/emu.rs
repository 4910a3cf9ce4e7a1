//! Threaded host: one OS thread per emulated CPU.
//!
//! # Architecture
//!
//! ```text
//!   Scenario ──► waker thread ──select_cpu/enqueue──► DsqStore ◄──dispatch── emu-cpu-N
//!                 ▲    │ timers (BinaryHeap)              │                     │
//!                 │    └─ watchdog                        └──── pop_local ─────►│
//!                 └──────────────── sleeping tasks ◄─────────── stopping ◄──────┘
//! ```
//!
//! Each CPU thread pops its local queue, asks the policy to dispatch when the
//! queue is empty, and parks with a timeout when nothing is runnable. Running
//! a task means sleeping for the granted slice (scaled down by
//! `time_dilation`). Sleeping tasks are handed to the waker thread, which
//! owns all timers, calls `select_cpu`/`enqueue` on wakeup, and applies the
//! scenario's controller writes.
//!
//! # Invariants
//! - At most one attachment per [`EmuHost`]; a second attach fails with
//!   [`AttachError::AlreadyActive`] until the first is detached.
//! - Every attach builds a fresh queue store, so a re-attached policy must
//!   re-create its queues in `init`.
//! - A task is touched by exactly one thread at a time: the CPU running it,
//!   the waker while it sleeps, or nobody while it sits in a queue.
//! - Once the policy records an exit, CPU threads stop calling it.
//!
//! # Watchdog
//! A task runnable for longer than `watchdog_timeout` of real time makes the
//! host record [`ExitKind::ErrorStall`] on the policy. The same scan counts
//! placement violations: a runnable task that sits in no queue and on no CPU
//! across two consecutive scans.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use crossbeam_utils::sync::{Parker, Unparker};
use log::{debug, error, info, warn};

use super::current_cpu::{current_cpu, set_current_cpu};
use super::{CgroupInfo, Host, IdleMask, SCX_ENQ_WAKEUP, SCX_WAKE_FORK, SCX_WAKE_TTWU};
use crate::dsq::DsqStore;
use crate::policy::{ExitInfo, ExitKind, PolicyError, SchedulingPolicy};
use crate::task::{CpuId, Pid, Task};
use crate::workload::{ControlAction, ControlEvent, PhaseCursor, Scenario};

/// Upper bound on how long the waker sleeps between watchdog checks.
const WAKER_POLL: Duration = Duration::from_millis(10);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct EmuConfig {
    pub nr_cpus: usize,

    /// Real time a task may stay runnable before the host reports a stall.
    pub watchdog_timeout: Duration,

    /// Park timeout for a CPU with nothing to run.
    ///
    /// Bounds the latency of work enqueued to a shared queue while every
    /// CPU was busy.
    pub idle_park: Duration,

    /// Workload nanoseconds per real nanosecond. `1` runs in real time.
    pub time_dilation: u32,
}

impl EmuConfig {
    /// Validate configuration. Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.nr_cpus > 0, "nr_cpus must be > 0");
        assert!(self.nr_cpus <= u32::MAX as usize, "nr_cpus must fit in u32");
        assert!(
            self.watchdog_timeout > Duration::ZERO,
            "watchdog_timeout must be > 0"
        );
        assert!(self.idle_park > Duration::ZERO, "idle_park must be > 0");
        assert!(self.time_dilation > 0, "time_dilation must be > 0");
    }
}

impl Default for EmuConfig {
    fn default() -> Self {
        Self {
            nr_cpus: thread::available_parallelism().map_or(1, |n| n.get()),
            watchdog_timeout: Duration::from_secs(30),
            idle_park: Duration::from_millis(1),
            time_dilation: 1,
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum AttachError {
    /// Another policy is attached to this host.
    AlreadyActive,
    /// The policy's `init` failed; nothing was started.
    Init(PolicyError),
    /// A CPU or waker thread could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "a scheduling policy is already attached"),
            Self::Init(err) => write!(f, "policy init failed: {err}"),
            Self::Spawn(err) => write!(f, "failed to spawn host thread: {err}"),
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AlreadyActive => None,
            Self::Init(err) => Some(err),
            Self::Spawn(err) => Some(err),
        }
    }
}

// ============================================================================
// Shared machine state
// ============================================================================

struct EmuTask {
    task: Arc<Task>,
    cursor: Mutex<PhaseCursor>,
    prev_cpu: AtomicU32,
    runtime_ns: AtomicU64,
    /// Nanoseconds since the epoch + 1 at which the task became runnable;
    /// 0 while it runs or sleeps.
    runnable_at: AtomicU64,
}

impl EmuTask {
    fn cursor(&self) -> MutexGuard<'_, PhaseCursor> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Timer {
    Arrive(usize),
    Wake(usize),
    Control(usize),
}

struct Machine {
    dsq: DsqStore,
    idle: IdleMask,
    unparkers: Vec<Unparker>,
    tasks: Vec<EmuTask>,
    by_pid: HashMap<Pid, usize>,
    cgroups: HashMap<Pid, CgroupInfo>,
    control: Vec<ControlEvent>,
    timers: Sender<(Instant, Timer)>,
    shutdown: AtomicBool,
    placement_violations: AtomicU64,
    epoch: Instant,
    cfg: EmuConfig,
}

impl Machine {
    fn new(
        cfg: EmuConfig,
        scenario: &Scenario,
        unparkers: Vec<Unparker>,
    ) -> (Self, Receiver<(Instant, Timer)>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut tasks = Vec::with_capacity(scenario.tasks.len());
        let mut by_pid = HashMap::with_capacity(scenario.tasks.len());
        let mut cgroups = HashMap::new();
        for (i, spec) in scenario.tasks.iter().enumerate() {
            by_pid.insert(spec.pid, i);
            if let Some(cg) = &spec.cgroup {
                cgroups.insert(spec.pid, cg.clone());
            }
            tasks.push(EmuTask {
                task: Arc::new(Task::new(spec.pid, spec.weight)),
                cursor: Mutex::new(PhaseCursor::new(spec)),
                prev_cpu: AtomicU32::new(i as u32 % cfg.nr_cpus as u32),
                runtime_ns: AtomicU64::new(0),
                runnable_at: AtomicU64::new(0),
            });
        }
        let machine = Self {
            dsq: DsqStore::new(cfg.nr_cpus),
            idle: IdleMask::new(cfg.nr_cpus),
            unparkers,
            tasks,
            by_pid,
            cgroups,
            control: scenario.control.clone(),
            timers: tx,
            shutdown: AtomicBool::new(false),
            placement_violations: AtomicU64::new(0),
            epoch: Instant::now(),
            cfg,
        };
        (machine, rx)
    }

    /// Real duration of `ns` workload nanoseconds.
    fn real(&self, ns: u64) -> Duration {
        Duration::from_nanos(ns / u64::from(self.cfg.time_dilation))
    }

    fn since_epoch_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn mark_runnable(&self, et: &EmuTask) {
        et.runnable_at
            .store(self.since_epoch_ns().saturating_add(1), Ordering::Relaxed);
    }

    fn stopping(&self, policy: &dyn SchedulingPolicy) -> bool {
        self.shutdown.load(Ordering::Acquire) || policy.maps().exit.has_exited()
    }

    fn unpark(&self, cpu: CpuId) {
        if let Some(u) = self.unparkers.get(cpu.index()) {
            u.unpark();
        }
    }

    fn unpark_all(&self) {
        for u in &self.unparkers {
            u.unpark();
        }
    }

    /// Wakes one idle CPU so it dispatches from the shared queues.
    fn kick_idle(&self) {
        if let Some(cpu) = self.idle.claim_any() {
            self.unpark(cpu);
        }
    }

    fn schedule(&self, after: Duration, timer: Timer) {
        // The receiver lives as long as the waker; a send error means we
        // are shutting down.
        let _ = self.timers.send((Instant::now() + after, timer));
    }

    fn task_index(&self, task: &Task) -> Option<usize> {
        self.by_pid.get(&task.pid()).copied()
    }
}

impl Host for Machine {
    fn nr_cpus(&self) -> usize {
        self.cfg.nr_cpus
    }

    fn dsq(&self) -> &DsqStore {
        &self.dsq
    }

    fn current_cpu(&self) -> CpuId {
        current_cpu().unwrap_or(CpuId::from_u32(0))
    }

    fn select_cpu_dfl(&self, _task: &Task, prev_cpu: CpuId, _wake_flags: u64) -> (CpuId, bool) {
        self.idle.select_dfl(prev_cpu)
    }

    fn task_cgroup(&self, task: &Task) -> Option<CgroupInfo> {
        self.cgroups.get(&task.pid()).cloned()
    }
}

// ============================================================================
// CPU threads
// ============================================================================

fn cpu_loop(m: &Machine, policy: &dyn SchedulingPolicy, cpu: CpuId, parker: &Parker) {
    set_current_cpu(Some(cpu));
    let mut prev: Option<Arc<Task>> = None;

    while !m.stopping(policy) {
        let next = m.dsq.pop_local(cpu).or_else(|| {
            policy.dispatch(m, cpu, prev.as_ref());
            m.dsq.pop_local(cpu)
        });
        prev = None;

        let Some(task) = next else {
            m.idle.set_idle(cpu);
            // Recheck after publishing the idle bit so a concurrent direct
            // insert is not left waiting for the park timeout.
            if m.dsq.local_len(cpu).unwrap_or(0) == 0 && !m.stopping(policy) {
                parker.park_timeout(m.cfg.idle_park);
            }
            m.idle.clear(cpu);
            continue;
        };

        if run_task(m, policy, cpu, &task) {
            prev = Some(task);
        }
    }

    set_current_cpu(None);
}

/// Runs one slice of `task`. Returns whether it is still runnable.
fn run_task(m: &Machine, policy: &dyn SchedulingPolicy, cpu: CpuId, task: &Arc<Task>) -> bool {
    let Some(i) = m.task_index(task) else {
        error!("{cpu}: dispatched unknown pid {}", task.pid());
        return false;
    };
    let et = &m.tasks[i];
    et.runnable_at.store(0, Ordering::Relaxed);
    et.prev_cpu.store(cpu.as_u32(), Ordering::Relaxed);

    policy.running(task);
    let run_ns = task.slice().min(et.cursor().run_left()).max(1);
    thread::sleep(m.real(run_ns));
    task.consume_slice(run_ns);
    et.runtime_ns.fetch_add(run_ns, Ordering::Relaxed);

    let after = et.cursor().after_run(run_ns);
    let runnable = after.is_ok();
    policy.stopping(task, runnable);

    match after {
        Ok(()) => {
            if !m.stopping(policy) {
                m.mark_runnable(et);
                policy.enqueue(m, task, 0);
                m.kick_idle();
            }
        }
        Err(Some(sleep_ns)) => m.schedule(m.real(sleep_ns), Timer::Wake(i)),
        Err(None) => debug!("pid {} finished", task.pid()),
    }
    runnable
}

// ============================================================================
// Waker thread
// ============================================================================

fn waker_loop(m: &Machine, policy: &dyn SchedulingPolicy, rx: &Receiver<(Instant, Timer)>) {
    let mut pending: BinaryHeap<Reverse<(Instant, Timer)>> = BinaryHeap::new();
    let mut unplaced: HashMap<usize, u64> = HashMap::new();

    while !m.stopping(policy) {
        let now = Instant::now();
        while let Some(Reverse((at, timer))) = pending.peek().copied() {
            if at > now {
                break;
            }
            pending.pop();
            fire(m, policy, timer);
        }

        check_watchdog(m, policy, &mut unplaced);

        let wait = pending
            .peek()
            .map_or(WAKER_POLL, |Reverse((at, _))| at.saturating_duration_since(now))
            .min(WAKER_POLL);
        match rx.recv_timeout(wait) {
            Ok((at, timer)) => pending.push(Reverse((at, timer))),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn fire(m: &Machine, policy: &dyn SchedulingPolicy, timer: Timer) {
    match timer {
        Timer::Arrive(i) => {
            let et = &m.tasks[i];
            policy.enable(&et.task);
            match et.cursor().next_run() {
                Some(0) => wake(m, policy, i, SCX_WAKE_FORK),
                Some(sleep_ns) => m.schedule(m.real(sleep_ns), Timer::Wake(i)),
                None => {}
            }
        }
        Timer::Wake(i) => wake(m, policy, i, SCX_WAKE_TTWU),
        Timer::Control(k) => apply_control(policy, &m.control[k]),
    }
}

fn wake(m: &Machine, policy: &dyn SchedulingPolicy, i: usize, wake_flags: u64) {
    let et = &m.tasks[i];
    let task = &et.task;
    let prev = CpuId::from_u32(et.prev_cpu.load(Ordering::Relaxed));

    m.mark_runnable(et);
    set_current_cpu(Some(prev));
    let cpu = policy.select_cpu(m, task, prev, wake_flags);
    let direct = task.is_queued();
    if !direct {
        policy.enqueue(m, task, SCX_ENQ_WAKEUP);
    }
    set_current_cpu(None);

    if direct {
        m.unpark(cpu);
    } else {
        m.kick_idle();
    }
}

fn apply_control(policy: &dyn SchedulingPolicy, ev: &ControlEvent) {
    let Some(table) = policy.maps().control else {
        warn!("controller write for pid {} ignored: policy has no control table", ev.pid);
        return;
    };
    match ev.action {
        ControlAction::Set { flag } => {
            if let Err(err) = table.set(ev.pid, flag) {
                warn!("controller write for pid {} failed: {err}", ev.pid);
            }
        }
        ControlAction::Clear => {
            table.clear(ev.pid);
        }
    }
}

fn check_watchdog(m: &Machine, policy: &dyn SchedulingPolicy, unplaced: &mut HashMap<usize, u64>) {
    let now = m.since_epoch_ns();
    let limit = u64::try_from(m.cfg.watchdog_timeout.as_nanos()).unwrap_or(u64::MAX);
    for (i, et) in m.tasks.iter().enumerate() {
        let at = et.runnable_at.load(Ordering::Relaxed);
        if at == 0 {
            unplaced.remove(&i);
            continue;
        }

        // A popped task clears its queued mark just before it starts
        // running, so only a mark missing on two scans of the same
        // runnable period counts.
        if et.task.is_queued() {
            unplaced.remove(&i);
        } else if unplaced.get(&i) == Some(&at) {
            m.placement_violations.fetch_add(1, Ordering::Relaxed);
            error!("pid {} is runnable but not queued", et.task.pid());
            unplaced.insert(i, u64::MAX);
        } else if unplaced.get(&i) != Some(&u64::MAX) {
            unplaced.insert(i, at);
        }

        let waited = now.saturating_sub(at - 1);
        if waited > limit {
            let msg = format!(
                "pid {} runnable for {:?}",
                et.task.pid(),
                Duration::from_nanos(waited)
            );
            error!("watchdog: {msg}");
            policy.exit(ExitInfo::new(ExitKind::ErrorStall).with_msg(msg));
            return;
        }
    }
}

// ============================================================================
// Host and attachment
// ============================================================================

/// Emulated machine a [`SchedulingPolicy`] can be attached to.
pub struct EmuHost {
    cfg: EmuConfig,
    active: Arc<AtomicBool>,
}

impl EmuHost {
    pub fn new(cfg: EmuConfig) -> Self {
        cfg.validate();
        Self {
            cfg,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &EmuConfig {
        &self.cfg
    }

    /// Whether a policy is currently attached.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Runs `policy.init`, then starts the CPU and waker threads on
    /// `scenario`'s tasks. The scenario's CPU count and duration are ignored;
    /// the host's own CPU count applies and the attachment runs until
    /// detached or until the policy exits.
    pub fn attach(
        &self,
        policy: Arc<dyn SchedulingPolicy>,
        scenario: &Scenario,
    ) -> Result<AttachHandle, AttachError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AttachError::AlreadyActive);
        }
        let result = self.start(policy, scenario);
        if result.is_err() {
            self.active.store(false, Ordering::Release);
        }
        result
    }

    fn start(
        &self,
        policy: Arc<dyn SchedulingPolicy>,
        scenario: &Scenario,
    ) -> Result<AttachHandle, AttachError> {
        let nr_cpus = self.cfg.nr_cpus;
        let mut parkers = Vec::with_capacity(nr_cpus);
        let mut unparkers = Vec::with_capacity(nr_cpus);
        for _ in 0..nr_cpus {
            let p = Parker::new();
            unparkers.push(p.unparker().clone());
            parkers.push(p);
        }

        let (machine, rx) = Machine::new(self.cfg, scenario, unparkers);
        let machine = Arc::new(machine);
        policy.init(&*machine).map_err(AttachError::Init)?;

        for (i, spec) in scenario.tasks.iter().enumerate() {
            machine.schedule(machine.real(spec.start_ns), Timer::Arrive(i));
        }
        for (k, ev) in scenario.control.iter().enumerate() {
            machine.schedule(machine.real(ev.at_ns), Timer::Control(k));
        }

        let mut handle = AttachHandle {
            machine: Arc::clone(&machine),
            policy: Arc::clone(&policy),
            threads: Vec::with_capacity(nr_cpus + 1),
            active: Arc::clone(&self.active),
            detached: false,
        };

        for (idx, parker) in parkers.into_iter().enumerate() {
            let m = Arc::clone(&machine);
            let p = Arc::clone(&policy);
            let spawned = thread::Builder::new()
                .name(format!("emu-cpu-{idx}"))
                .spawn(move || cpu_loop(&m, &*p, CpuId::from_index(idx), &parker));
            match spawned {
                Ok(th) => handle.threads.push(th),
                Err(err) => {
                    handle.stop();
                    return Err(AttachError::Spawn(err));
                }
            }
        }

        let m = Arc::clone(&machine);
        let p = Arc::clone(&policy);
        let spawned = thread::Builder::new()
            .name("emu-waker".into())
            .spawn(move || waker_loop(&m, &*p, &rx));
        match spawned {
            Ok(th) => handle.threads.push(th),
            Err(err) => {
                handle.stop();
                return Err(AttachError::Spawn(err));
            }
        }

        info!(
            "attached policy {} to {} emulated cpus ({} tasks)",
            policy.name(),
            nr_cpus,
            scenario.tasks.len()
        );
        Ok(handle)
    }
}

impl fmt::Debug for EmuHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmuHost")
            .field("cfg", &self.cfg)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A running attachment. Dropping it detaches.
pub struct AttachHandle {
    machine: Arc<Machine>,
    policy: Arc<dyn SchedulingPolicy>,
    threads: Vec<JoinHandle<()>>,
    active: Arc<AtomicBool>,
    detached: bool,
}

impl AttachHandle {
    /// Whether the policy has recorded an exit (its own, a watchdog stall,
    /// or a [`request_exit`](Self::request_exit)).
    pub fn exited(&self) -> bool {
        self.policy.maps().exit.has_exited()
    }

    /// Host-initiated exit, e.g. a CPU hotplug event. The policy's first
    /// recorded exit wins.
    pub fn request_exit(&self, info: ExitInfo) {
        info!("host requested exit: {info}");
        self.policy.exit(info);
        self.machine.unpark_all();
    }

    pub fn policy(&self) -> &Arc<dyn SchedulingPolicy> {
        &self.policy
    }

    /// Total CPU time granted per task, in workload nanoseconds.
    pub fn runtime_ns(&self) -> BTreeMap<Pid, u64> {
        self.machine
            .tasks
            .iter()
            .map(|et| (et.task.pid(), et.runtime_ns.load(Ordering::Relaxed)))
            .collect()
    }

    /// Runnable tasks found in no queue and on no CPU.
    pub fn placement_violations(&self) -> u64 {
        self.machine.placement_violations.load(Ordering::Relaxed)
    }

    /// Inserts the queue store had to reroute to a fallback queue.
    pub fn misroutes(&self) -> u64 {
        self.machine.dsq.misroutes()
    }

    /// Inserts of a task that was already queued.
    pub fn double_inserts(&self) -> u64 {
        self.machine.dsq.double_inserts()
    }

    /// Stops all threads and returns the exit the policy recorded. If the
    /// policy had not exited, an [`ExitKind::Unreg`] exit is recorded first.
    pub fn detach(mut self) -> ExitInfo {
        self.stop()
    }

    fn stop(&mut self) -> ExitInfo {
        if !self.detached {
            self.detached = true;
            self.machine.shutdown.store(true, Ordering::Release);
            self.machine.unpark_all();
            while let Some(th) = self.threads.pop() {
                if th.join().is_err() {
                    error!("host thread panicked");
                }
            }
            if !self.exited() {
                self.policy.exit(ExitInfo::new(ExitKind::Unreg));
            }
            self.active.store(false, Ordering::Release);
        }
        self.policy
            .maps()
            .exit
            .get()
            .cloned()
            .unwrap_or_else(|| ExitInfo::new(ExitKind::Unreg))
    }
}

impl Drop for AttachHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for AttachHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachHandle")
            .field("policy", &self.policy.name())
            .field("threads", &self.threads.len())
            .field("exited", &self.exited())
            .finish()
    }
}
