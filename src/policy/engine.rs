//! `CtrlPolicy`: weighted-vtime (or FIFO) scheduling with an external
//! throttling control table.
//!
//! # Entitlement
//! Each task carries a virtual time. Running for `d` ns of the default slice
//! charges `d × 100 / weight`, so a weight-200 task accrues vtime at half the
//! rate of a weight-100 task and gets dispatched twice as often. The shared
//! queue is ordered by vtime, and the global clock tracks the vtime of the
//! latest task to start running.
//!
//! A waking task's vtime is clamped to at most one slice behind the clock: a
//! long sleeper gets a head start of one slice, not its whole sleep.
//!
//! # Throttling
//! With `control` on, every placement decision looks up the task's PID in the
//! control table. Stopped tasks get a short slice on enqueue and are diverted
//! from the shared queue into the throttle queue at dispatch time. The throttle
//! queue is served when the shared queue runs dry, and every
//! `throttle_drain_period` rounds per CPU, so stopped tasks run much less but
//! never starve.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use log::{debug, info, log_enabled, Level};

use super::config::{ConfigError, PolicyConfig, SchedMode};
use super::exit::{ExitInfo, ExitRecord};
use super::{PolicyError, PolicyMaps, SchedulingPolicy};
use crate::ctrl_table::{ControlState, ProcessControlTable};
use crate::dsq::{DsqError, DsqId, DsqKind, MoveOutcome, SHARED_DSQ, THROTTLE_DSQ};
use crate::host::Host;
use crate::stats::{StatIdx, Stats};
use crate::task::{CpuId, Task, DEFAULT_WEIGHT};
use crate::vtime::VtimeClock;

pub struct CtrlPolicy {
    cfg: PolicyConfig,
    clock: VtimeClock,
    table: Arc<ProcessControlTable>,
    stats: Stats,
    exit: ExitRecord,
    /// Per-CPU dispatch round counters driving the periodic throttle drain.
    rounds: Box<[CachePadded<AtomicU64>]>,
}

impl CtrlPolicy {
    /// Creates a policy with its own control table.
    pub fn new(cfg: PolicyConfig, nr_cpus: usize) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let table = Arc::new(ProcessControlTable::new(cfg.max_control_entries));
        Self::with_control_table(cfg, nr_cpus, table)
    }

    /// Creates a policy sharing an existing control table, so a loader can
    /// keep controller state across re-attaches.
    pub fn with_control_table(
        cfg: PolicyConfig,
        nr_cpus: usize,
        table: Arc<ProcessControlTable>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let nr_cpus = nr_cpus.max(1);
        Ok(Self {
            cfg,
            clock: VtimeClock::new(),
            table,
            stats: Stats::new(nr_cpus),
            exit: ExitRecord::new(),
            rounds: (0..nr_cpus).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
        })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.cfg
    }

    pub fn clock(&self) -> &VtimeClock {
        &self.clock
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn control_table(&self) -> &Arc<ProcessControlTable> {
        &self.table
    }

    pub fn exit_info(&self) -> Option<&ExitInfo> {
        self.exit.get()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.has_exited()
    }

    #[inline(always)]
    fn control_state(&self, task: &Task) -> ControlState {
        if self.cfg.control {
            self.table.get(task.pid())
        } else {
            ControlState::NotTracked
        }
    }

    fn queue_kind(&self) -> DsqKind {
        match self.cfg.mode {
            SchedMode::Vtime => DsqKind::Vtime,
            SchedMode::Fifo => DsqKind::Fifo,
        }
    }

    fn create_dsq(&self, host: &dyn Host, id: DsqId) -> Result<(), PolicyError> {
        let kind = self.queue_kind();
        match host.dsq().create(id, kind) {
            Ok(()) => Ok(()),
            Err(DsqError::Exists { kind: existing, .. }) if existing == kind => {
                debug!("dsq {id:#x} already exists, reusing");
                Ok(())
            }
            Err(source) => Err(PolicyError::DsqCreate { id, source }),
        }
    }

    /// Diagnostic line for a tracked task, with the host's cgroup view.
    fn trace_tracked(&self, host: &dyn Host, task: &Task, event: &str, state: ControlState) {
        if !log_enabled!(Level::Debug) {
            return;
        }
        match host.task_cgroup(task) {
            Some(cg) => debug!(
                "{event}: pid={} state={state:?} cgroup={} id={} level={}",
                task.pid(),
                cg.name,
                cg.id,
                cg.level
            ),
            None => debug!("{event}: pid={} state={state:?}", task.pid()),
        }
    }
}

impl SchedulingPolicy for CtrlPolicy {
    fn name(&self) -> &'static str {
        "ctrl"
    }

    fn init(&self, host: &dyn Host) -> Result<(), PolicyError> {
        self.create_dsq(host, SHARED_DSQ)?;
        if self.cfg.control {
            self.create_dsq(host, THROTTLE_DSQ)?;
        }
        info!(
            "{} policy initialized: mode={:?} control={} nr_cpus={}",
            self.name(),
            self.cfg.mode,
            self.cfg.control,
            host.nr_cpus()
        );
        Ok(())
    }

    fn select_cpu(
        &self,
        host: &dyn Host,
        task: &Arc<Task>,
        prev_cpu: CpuId,
        wake_flags: u64,
    ) -> CpuId {
        let (cpu, is_idle) = host.select_cpu_dfl(task, prev_cpu, wake_flags);
        if is_idle {
            host.dsq().insert_local(cpu, task, self.cfg.slice_dfl_ns);
            self.stats.inc(cpu, StatIdx::Local);
        }

        let state = self.control_state(task);
        if state.is_tracked() {
            let event = if is_idle { "select_cpu/idle" } else { "select_cpu" };
            self.trace_tracked(host, task, event, state);
        }
        cpu
    }

    fn enqueue(&self, host: &dyn Host, task: &Arc<Task>, _enq_flags: u64) {
        self.stats.inc(host.current_cpu(), StatIdx::Global);
        let dsq = host.dsq();

        match self.cfg.mode {
            SchedMode::Fifo => dsq.insert(SHARED_DSQ, task, None, self.cfg.slice_dfl_ns),
            SchedMode::Vtime => {
                let vtime = self.clock.clamp_floor(task.dsq_vtime(), self.cfg.slice_dfl_ns);
                let slice = if self.control_state(task).is_stopped() {
                    self.cfg.throttled_slice_ns
                } else {
                    self.cfg.slice_dfl_ns
                };
                dsq.insert(SHARED_DSQ, task, Some(vtime), slice);
            }
        }
    }

    fn dispatch(&self, host: &dyn Host, cpu: CpuId, _prev: Option<&Arc<Task>>) {
        let dsq = host.dsq();
        if !self.cfg.control {
            dsq.move_head(SHARED_DSQ, cpu);
            return;
        }

        let period = u64::from(self.cfg.throttle_drain_period);
        let round =
            self.rounds[cpu.index() % self.rounds.len()].fetch_add(1, Ordering::Relaxed) + 1;
        if round % period == 0 && dsq.move_head(THROTTLE_DSQ, cpu) {
            return;
        }

        for _ in 0..self.cfg.dispatch_batch {
            let outcome = dsq.divert_head(SHARED_DSQ, cpu, THROTTLE_DSQ, |t| {
                self.table.get(t.pid()).is_stopped()
            });
            match outcome {
                MoveOutcome::Moved => return,
                MoveOutcome::Diverted => self.stats.inc(cpu, StatIdx::Throttled),
                MoveOutcome::Empty => break,
            }
        }
        dsq.move_head(THROTTLE_DSQ, cpu);
    }

    fn running(&self, task: &Task) {
        if self.cfg.mode == SchedMode::Fifo {
            return;
        }
        self.clock.advance_if_greater(task.dsq_vtime());
    }

    fn stopping(&self, task: &Task, _runnable: bool) {
        if self.cfg.mode == SchedMode::Fifo {
            return;
        }
        let used = self.cfg.slice_dfl_ns.saturating_sub(task.slice());
        let charge =
            used.saturating_mul(u64::from(DEFAULT_WEIGHT)) / u64::from(task.weight().max(1));
        task.charge_vtime(charge);
    }

    fn enable(&self, task: &Task) {
        task.set_dsq_vtime(self.clock.read());
    }

    fn exit(&self, info: ExitInfo) {
        let msg = info.to_string();
        if self.exit.record(info) {
            info!("{} policy exiting: {msg}", self.name());
        } else {
            debug!("{} policy: ignoring later exit: {msg}", self.name());
        }
    }

    fn maps(&self) -> PolicyMaps<'_> {
        PolicyMaps {
            exit: &self.exit,
            stats: Some(&self.stats),
            control: Some(&self.table),
            vtime: Some(&self.clock),
        }
    }
}

impl std::fmt::Debug for CtrlPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrlPolicy")
            .field("cfg", &self.cfg)
            .field("clock", &self.clock.read())
            .field("stats", &self.stats.snapshot())
            .field("exited", &self.has_exited())
            .finish()
    }
}
