//! Discrete-event simulation of a machine running a policy, with oracles.
//!
//! The runner interprets a [`Scenario`] on a [`SimHost`]: tasks arrive, run
//! for their phases in slices granted by the policy, sleep, and wake again.
//! Every callback is invoked from a single thread in a fixed order, so a
//! scenario replays identically.
//!
//! # Oracles
//! Checked on every step; the first violation ends the run with a
//! [`FailureReport`]:
//! - **placement**: a runnable task is queued after `select_cpu`/`enqueue`;
//! - **single ownership**: a popped task is runnable, and the store never saw a
//!   double insertion or an unknown queue ID;
//! - **clock**: the policy's vtime clock never moves backwards;
//! - **fairness**: a runnable task starts running within
//!   `fairness_bound_rounds` task starts of becoming runnable.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::host::{Host, SCX_ENQ_WAKEUP, SCX_WAKE_TTWU};
use crate::policy::{ExitInfo, ExitKind, SchedulingPolicy};
use crate::stats::StatsSnapshot;
use crate::task::{CpuId, Pid, Task};
use crate::vtime::time_before;
use crate::workload::{ControlAction, PhaseCursor, Scenario, ScenarioError};

use super::clock::SimClock;
use super::host::SimHost;
use super::trace::{TraceEvent, TraceRing};

/// Runnable task left unqueued by the policy.
pub const INV_UNPLACED: u32 = 1;
/// Vtime clock observed moving backwards.
pub const INV_CLOCK_REGRESSED: u32 = 2;
/// Task queued twice, or popped while not runnable.
pub const INV_DOUBLE_QUEUED: u32 = 3;
/// Insertion into a queue that does not exist.
pub const INV_MISROUTE: u32 = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimConfig {
    pub trace_cap: usize,
    /// Maximum task starts a runnable task may wait. `None` derives a bound
    /// from the task count and weight spread.
    pub fairness_bound_rounds: Option<u64>,
    /// Event budget; exceeding it is reported as a hang.
    pub max_events: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            trace_cap: 4096,
            fairness_bound_rounds: None,
            max_events: 50_000_000,
        }
    }
}

#[derive(Clone, Debug)]
pub enum RunOutcome {
    Ok(SimReport),
    Failed(FailureReport),
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, RunOutcome::Ok(_))
    }

    pub fn into_result(self) -> Result<SimReport, FailureReport> {
        match self {
            RunOutcome::Ok(report) => Ok(report),
            RunOutcome::Failed(fail) => Err(fail),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
    /// Index of the event that failed.
    pub step: u64,
    pub t_ns: u64,
    pub trace: Vec<TraceEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Hang,
    InvariantViolation { code: u32 },
    FairnessViolation,
    ProgramError,
}

/// What a completed run observed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimReport {
    pub end_ns: u64,
    /// CPU time per PID.
    pub runtime_ns: BTreeMap<Pid, u64>,
    /// Number of times each PID started running.
    pub runs: BTreeMap<Pid, u64>,
    /// PIDs in the order they started running, across all CPUs.
    pub dispatch_order: Vec<Pid>,
    /// Vtime clock read after every `running` callback.
    pub clock_samples: Vec<u64>,
    /// Longest wait, in task starts, of any runnable task.
    pub max_wait_rounds: u64,
    pub stats: Option<StatsSnapshot>,
    pub exit: Option<ExitInfo>,
    pub trace: Vec<TraceEvent>,
}

impl SimReport {
    pub fn runtime(&self, pid: Pid) -> u64 {
        self.runtime_ns.get(&pid).copied().unwrap_or(0)
    }

    /// Fraction of all simulated CPU time that went to `pid`.
    pub fn share(&self, pid: Pid) -> f64 {
        let total: u64 = self.runtime_ns.values().sum();
        if total == 0 {
            return 0.0;
        }
        self.runtime(pid) as f64 / total as f64
    }
}

pub struct SimRunner {
    scenario: Scenario,
    cfg: SimConfig,
}

impl SimRunner {
    pub fn new(scenario: Scenario, cfg: SimConfig) -> Result<Self, ScenarioError> {
        scenario.validate()?;
        Ok(Self { scenario, cfg })
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Runs the scenario to `duration_ns` (or until every task exits, or the
    /// policy exits) and detaches the policy.
    pub fn run(&self, policy: &dyn SchedulingPolicy) -> RunOutcome {
        Sim::new(&self.scenario, &self.cfg, policy).run()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    Arrive(usize),
    Wake(usize),
    Stop(usize),
    Resched(usize),
    Control(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Pending,
    Runnable,
    Running,
    Sleeping,
    Done,
}

struct TaskSlot {
    task: Arc<Task>,
    cursor: PhaseCursor,
    prev_cpu: CpuId,
    state: SlotState,
    runtime_ns: u64,
    runs: u64,
    waiting_since: Option<u64>,
}

#[derive(Clone, Copy, Default)]
struct CpuSlot {
    running: Option<usize>,
    started_ns: u64,
    run_len: u64,
    prev: Option<usize>,
    resched_pending: bool,
}

type SimResult = Result<(), FailureReport>;

struct Sim<'a> {
    scenario: &'a Scenario,
    cfg: &'a SimConfig,
    policy: &'a dyn SchedulingPolicy,
    host: SimHost,
    clock: SimClock,
    events: BinaryHeap<Reverse<(u64, u64, EventKind)>>,
    seq: u64,
    tasks: Vec<TaskSlot>,
    by_pid: BTreeMap<Pid, usize>,
    cpus: Vec<CpuSlot>,
    rounds: u64,
    steps: u64,
    fairness_bound: u64,
    max_wait: u64,
    last_vtime: Option<u64>,
    trace: TraceRing,
    dispatch_order: Vec<Pid>,
    clock_samples: Vec<u64>,
}

impl<'a> Sim<'a> {
    fn new(scenario: &'a Scenario, cfg: &'a SimConfig, policy: &'a dyn SchedulingPolicy) -> Self {
        let nr_cpus = scenario.nr_cpus.max(1);
        let cgroups = scenario
            .tasks
            .iter()
            .filter_map(|t| t.cgroup.clone().map(|cg| (t.pid, cg)))
            .collect();

        let tasks: Vec<TaskSlot> = scenario
            .tasks
            .iter()
            .map(|spec| TaskSlot {
                task: Arc::new(Task::new(spec.pid, spec.weight)),
                cursor: PhaseCursor::new(spec),
                prev_cpu: CpuId::from_index(spec.pid as usize % nr_cpus),
                state: SlotState::Pending,
                runtime_ns: 0,
                runs: 0,
                waiting_since: None,
            })
            .collect();
        let by_pid = tasks.iter().enumerate().map(|(i, s)| (s.task.pid(), i)).collect();

        let fairness_bound = cfg.fairness_bound_rounds.unwrap_or_else(|| {
            let min_w = tasks.iter().map(|s| s.task.weight()).min().unwrap_or(1).max(1);
            let max_w = tasks.iter().map(|s| s.task.weight()).max().unwrap_or(1);
            let ratio = u64::from(max_w.div_ceil(min_w));
            (tasks.len() as u64) * ratio * 32 + 1024
        });

        Self {
            scenario,
            cfg,
            policy,
            host: SimHost::with_cgroups(nr_cpus, cgroups),
            clock: SimClock::new(),
            events: BinaryHeap::new(),
            seq: 0,
            tasks,
            by_pid,
            cpus: vec![CpuSlot::default(); nr_cpus],
            rounds: 0,
            steps: 0,
            fairness_bound,
            max_wait: 0,
            last_vtime: None,
            trace: TraceRing::new(cfg.trace_cap),
            dispatch_order: Vec::new(),
            clock_samples: Vec::new(),
        }
    }

    fn push(&mut self, t: u64, kind: EventKind) {
        self.events.push(Reverse((t, self.seq, kind)));
        self.seq += 1;
    }

    fn fail(&self, kind: FailureKind, message: impl Into<String>) -> FailureReport {
        FailureReport {
            kind,
            message: message.into(),
            step: self.steps,
            t_ns: self.clock.now_ns(),
            trace: self.trace.dump(),
        }
    }

    fn run(mut self) -> RunOutcome {
        if let Err(err) = self.policy.init(&self.host) {
            return RunOutcome::Failed(self.fail(FailureKind::ProgramError, format!("init: {err}")));
        }
        for cpu in 0..self.cpus.len() {
            self.host.idle().set_idle(CpuId::from_index(cpu));
        }
        for i in 0..self.tasks.len() {
            let start = self.scenario.tasks[i].start_ns;
            if let Some(sleep) = self.tasks[i].cursor.next_run() {
                self.push(start.saturating_add(sleep), EventKind::Arrive(i));
            }
        }
        for i in 0..self.scenario.control.len() {
            self.push(self.scenario.control[i].at_ns, EventKind::Control(i));
        }

        let duration = self.scenario.duration_ns;
        let mut end_ns = None;
        while let Some(Reverse((t, _, kind))) = self.events.pop() {
            if t > duration {
                end_ns = Some(duration);
                break;
            }
            self.steps += 1;
            if self.steps > self.cfg.max_events {
                return RunOutcome::Failed(self.fail(FailureKind::Hang, "event budget exhausted"));
            }
            self.clock.advance_to(t);

            let res = match kind {
                EventKind::Arrive(i) => {
                    self.policy.enable(&self.tasks[i].task);
                    self.wake(i)
                }
                EventKind::Wake(i) => self.wake(i),
                EventKind::Stop(cpu) => self.stop(cpu),
                EventKind::Resched(cpu) => self.resched(cpu),
                EventKind::Control(i) => self.control(i),
            };
            if let Err(fail) = res {
                return RunOutcome::Failed(fail);
            }
            if self.policy.maps().exit.has_exited() {
                break;
            }
        }

        let end_ns = end_ns.unwrap_or_else(|| self.clock.now_ns());
        self.finish(end_ns)
    }

    fn kick_idle(&mut self) {
        let now = self.clock.now_ns();
        for cpu in 0..self.cpus.len() {
            let slot = self.cpus[cpu];
            if slot.running.is_none() && !slot.resched_pending {
                self.cpus[cpu].resched_pending = true;
                self.push(now, EventKind::Resched(cpu));
            }
        }
    }

    fn check_placed(&self, task: &Task, what: &str) -> SimResult {
        if task.is_queued() {
            Ok(())
        } else {
            Err(self.fail(
                FailureKind::InvariantViolation { code: INV_UNPLACED },
                format!("pid {} not queued after {what}", task.pid()),
            ))
        }
    }

    fn wake(&mut self, i: usize) -> SimResult {
        let now = self.clock.now_ns();
        let task = Arc::clone(&self.tasks[i].task);
        let prev = self.tasks[i].prev_cpu;
        self.tasks[i].state = SlotState::Runnable;

        self.host.set_current_cpu(prev);
        let cpu = self.policy.select_cpu(&self.host, &task, prev, SCX_WAKE_TTWU);
        let direct = task.is_queued();
        if !direct {
            self.policy.enqueue(&self.host, &task, SCX_ENQ_WAKEUP);
            self.trace.push(TraceEvent::Enqueue {
                t: now,
                pid: task.pid(),
                vtime: task.dsq_vtime(),
                slice: task.slice(),
            });
        }
        self.check_placed(&task, "wakeup")?;
        self.trace.push(TraceEvent::Wake {
            t: now,
            pid: task.pid(),
            cpu: cpu.as_u32(),
            direct,
        });

        self.tasks[i].waiting_since = Some(self.rounds);
        self.kick_idle();
        Ok(())
    }

    fn resched(&mut self, cpu: usize) -> SimResult {
        self.cpus[cpu].resched_pending = false;
        if self.cpus[cpu].running.is_some() {
            return Ok(());
        }
        let cpu_id = CpuId::from_index(cpu);
        self.host.set_current_cpu(cpu_id);

        let mut next = self.host.dsq().pop_local(cpu_id);
        if next.is_none() {
            let prev = self.cpus[cpu].prev.map(|i| Arc::clone(&self.tasks[i].task));
            self.policy.dispatch(&self.host, cpu_id, prev.as_ref());
            next = self.host.dsq().pop_local(cpu_id);
            if let Some(task) = &next {
                self.trace.push(TraceEvent::Dispatch {
                    t: self.clock.now_ns(),
                    cpu: cpu_id.as_u32(),
                    pid: task.pid(),
                });
            }
        }

        match next {
            Some(task) => self.start(cpu, task),
            None => {
                self.host.idle().set_idle(cpu_id);
                self.trace.push(TraceEvent::Idle {
                    t: self.clock.now_ns(),
                    cpu: cpu_id.as_u32(),
                });
                Ok(())
            }
        }
    }

    fn start(&mut self, cpu: usize, task: Arc<Task>) -> SimResult {
        let now = self.clock.now_ns();
        let cpu_id = CpuId::from_index(cpu);
        let Some(&i) = self.by_pid.get(&task.pid()) else {
            return Err(self.fail(
                FailureKind::ProgramError,
                format!("unknown pid {} dispatched", task.pid()),
            ));
        };
        if self.tasks[i].state != SlotState::Runnable {
            return Err(self.fail(
                FailureKind::InvariantViolation {
                    code: INV_DOUBLE_QUEUED,
                },
                format!("pid {} dispatched while {:?}", task.pid(), self.tasks[i].state),
            ));
        }

        let policy = self.policy;
        self.host.idle().clear(cpu_id);
        policy.running(&task);
        if let Some(vtime) = policy.maps().vtime {
            let v = vtime.read();
            if let Some(last) = self.last_vtime {
                if time_before(v, last) {
                    return Err(self.fail(
                        FailureKind::InvariantViolation {
                            code: INV_CLOCK_REGRESSED,
                        },
                        format!("vtime clock moved from {last} to {v}"),
                    ));
                }
            }
            self.last_vtime = Some(v);
            self.clock_samples.push(v);
        }

        let slot = &mut self.tasks[i];
        let slice = task.slice();
        let run_len = slice.min(slot.cursor.run_left()).max(1);
        if let Some(since) = slot.waiting_since.take() {
            self.max_wait = self.max_wait.max(self.rounds - since);
        }
        slot.state = SlotState::Running;
        slot.prev_cpu = cpu_id;
        slot.runs += 1;
        self.rounds += 1;

        self.cpus[cpu].running = Some(i);
        self.cpus[cpu].started_ns = now;
        self.cpus[cpu].run_len = run_len;
        self.dispatch_order.push(task.pid());
        self.trace.push(TraceEvent::Run {
            t: now,
            cpu: cpu_id.as_u32(),
            pid: task.pid(),
            slice,
        });
        self.push(now.saturating_add(run_len), EventKind::Stop(cpu));
        self.check_fairness()
    }

    fn check_fairness(&self) -> SimResult {
        for slot in &self.tasks {
            if let Some(since) = slot.waiting_since {
                if self.rounds - since > self.fairness_bound {
                    return Err(self.fail(
                        FailureKind::FairnessViolation,
                        format!(
                            "pid {} runnable for {} starts (bound {})",
                            slot.task.pid(),
                            self.rounds - since,
                            self.fairness_bound
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn stop(&mut self, cpu: usize) -> SimResult {
        let now = self.clock.now_ns();
        let cpu_id = CpuId::from_index(cpu);
        let Some(i) = self.cpus[cpu].running.take() else {
            return Ok(());
        };
        let ran = self.cpus[cpu].run_len;
        self.cpus[cpu].prev = Some(i);

        let slot = &mut self.tasks[i];
        let task = Arc::clone(&slot.task);
        task.consume_slice(ran);
        slot.runtime_ns += ran;
        let (runnable, sleep_ns) = match slot.cursor.after_run(ran) {
            Ok(()) => (true, None),
            Err(sleep) => (false, sleep),
        };

        self.host.set_current_cpu(cpu_id);
        self.policy.stopping(&task, runnable);
        self.trace.push(TraceEvent::Stop {
            t: now,
            cpu: cpu_id.as_u32(),
            pid: task.pid(),
            ran_ns: ran,
            runnable,
        });

        if runnable {
            self.tasks[i].state = SlotState::Runnable;
            self.policy.enqueue(&self.host, &task, 0);
            self.trace.push(TraceEvent::Enqueue {
                t: now,
                pid: task.pid(),
                vtime: task.dsq_vtime(),
                slice: task.slice(),
            });
            self.check_placed(&task, "enqueue")?;
            self.tasks[i].waiting_since = Some(self.rounds);
        } else if let Some(sleep) = sleep_ns {
            self.tasks[i].state = SlotState::Sleeping;
            self.push(now.saturating_add(sleep), EventKind::Wake(i));
        } else {
            self.tasks[i].state = SlotState::Done;
        }

        self.kick_idle();
        Ok(())
    }

    fn control(&mut self, k: usize) -> SimResult {
        let ev = self.scenario.control[k];
        let policy = self.policy;
        let Some(table) = policy.maps().control else {
            return Ok(());
        };
        let flag = match ev.action {
            ControlAction::Set { flag } => {
                table
                    .set(ev.pid, flag)
                    .map_err(|err| self.fail(FailureKind::ProgramError, err.to_string()))?;
                Some(flag)
            }
            ControlAction::Clear => {
                table.clear(ev.pid);
                None
            }
        };
        self.trace.push(TraceEvent::ControlSet {
            t: self.clock.now_ns(),
            pid: ev.pid,
            flag,
        });
        Ok(())
    }

    fn finish(mut self, end_ns: u64) -> RunOutcome {
        for cpu in &self.cpus {
            if let Some(i) = cpu.running {
                let ran = end_ns.saturating_sub(cpu.started_ns).min(cpu.run_len);
                self.tasks[i].runtime_ns += ran;
            }
        }

        let dsq = self.host.dsq();
        if dsq.double_inserts() > 0 {
            return RunOutcome::Failed(self.fail(
                FailureKind::InvariantViolation {
                    code: INV_DOUBLE_QUEUED,
                },
                format!("{} double insertions", dsq.double_inserts()),
            ));
        }
        if dsq.misroutes() > 0 {
            return RunOutcome::Failed(self.fail(
                FailureKind::InvariantViolation { code: INV_MISROUTE },
                format!("{} misrouted insertions", dsq.misroutes()),
            ));
        }

        let policy = self.policy;
        if !policy.maps().exit.has_exited() {
            policy.exit(ExitInfo::new(ExitKind::Unreg));
        }
        let maps = policy.maps();
        let exit = maps.exit.get().cloned();
        if let Some(info) = &exit {
            self.trace.push(TraceEvent::Exit {
                t: end_ns,
                kind: info.kind,
            });
        }

        RunOutcome::Ok(SimReport {
            end_ns,
            runtime_ns: self
                .tasks
                .iter()
                .map(|s| (s.task.pid(), s.runtime_ns))
                .collect(),
            runs: self.tasks.iter().map(|s| (s.task.pid(), s.runs)).collect(),
            dispatch_order: self.dispatch_order,
            clock_samples: self.clock_samples,
            max_wait_rounds: self.max_wait,
            stats: maps.stats.map(|s| s.snapshot()),
            exit,
            trace: self.trace.dump(),
        })
    }
}
