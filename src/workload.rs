//! Synthetic workloads shared by the simulated and emulated hosts.
//!
//! A [`Scenario`] is a set of tasks, each a (usually looping) program of run
//! and sleep phases, plus a timeline of controller writes. Scenarios are plain
//! serde types so they can be checked into test fixtures or passed to the
//! loader with `--scenario FILE`:
//!
//! ```json
//! {
//!   "nr_cpus": 2,
//!   "duration_ns": 2000000000,
//!   "tasks": [
//!     { "pid": 100, "weight": 100, "phases": [{ "run": { "ns": 50000000 } }] },
//!     { "pid": 101, "phases": [{ "run": { "ns": 2000000 } }, { "sleep": { "ns": 8000000 } }] }
//!   ],
//!   "control": [{ "at_ns": 500000000, "pid": 100, "action": { "set": { "flag": 1 } } }]
//! }
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::host::CgroupInfo;
use crate::sim::SimRng;
use crate::task::{Pid, DEFAULT_WEIGHT, MAX_WEIGHT};

/// One step of a task program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Consume `ns` of CPU time (possibly across several slices).
    Run { ns: u64 },
    /// Block for `ns` of wall time.
    Sleep { ns: u64 },
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub pid: Pid,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Arrival time.
    #[serde(default)]
    pub start_ns: u64,
    pub phases: Vec<Phase>,
    /// Restart the program after the last phase instead of exiting.
    #[serde(default = "default_true")]
    pub repeat: bool,
    #[serde(default)]
    pub cgroup: Option<CgroupInfo>,
}

impl TaskSpec {
    /// A task that never blocks.
    pub fn hog(pid: Pid, weight: u32) -> Self {
        Self {
            pid,
            weight,
            start_ns: 0,
            phases: vec![Phase::Run { ns: 100_000_000 }],
            repeat: true,
            cgroup: None,
        }
    }

    /// A task alternating short bursts and sleeps.
    pub fn interactive(pid: Pid, run_ns: u64, sleep_ns: u64) -> Self {
        Self {
            pid,
            weight: DEFAULT_WEIGHT,
            start_ns: 0,
            phases: vec![Phase::Run { ns: run_ns }, Phase::Sleep { ns: sleep_ns }],
            repeat: true,
            cgroup: None,
        }
    }

    pub fn starting_at(mut self, start_ns: u64) -> Self {
        self.start_ns = start_ns;
        self
    }

    pub fn in_cgroup(mut self, cgroup: CgroupInfo) -> Self {
        self.cgroup = Some(cgroup);
        self
    }
}

/// Position of a task within its phase program.
#[derive(Clone, Debug)]
pub struct PhaseCursor {
    phases: Vec<Phase>,
    repeat: bool,
    next: usize,
    run_left: u64,
}

impl PhaseCursor {
    pub fn new(spec: &TaskSpec) -> Self {
        Self {
            phases: spec.phases.clone(),
            repeat: spec.repeat,
            next: 0,
            run_left: 0,
        }
    }

    /// CPU time left in the current run phase.
    #[inline]
    pub fn run_left(&self) -> u64 {
        self.run_left
    }

    /// Accounts `ns` of CPU time; returns what is left of the run phase.
    #[inline]
    pub fn consume(&mut self, ns: u64) -> u64 {
        self.run_left = self.run_left.saturating_sub(ns);
        self.run_left
    }

    /// Advances to the next run phase. Returns the sleep accumulated on the
    /// way, or `None` when the program ends.
    pub fn next_run(&mut self) -> Option<u64> {
        let n = self.phases.len();
        let mut sleep = 0u64;
        for _ in 0..=n {
            if self.next >= n {
                if !self.repeat {
                    return None;
                }
                self.next = 0;
            }
            let phase = self.phases[self.next];
            self.next += 1;
            match phase {
                Phase::Run { ns } => {
                    self.run_left = ns;
                    return Some(sleep);
                }
                Phase::Sleep { ns } => sleep = sleep.saturating_add(ns),
            }
        }
        None
    }

    /// What happens after the task ran `ns`: `Ok(())` if it stays runnable,
    /// `Err(Some(sleep))` if it blocks, `Err(None)` if it exits.
    pub fn after_run(&mut self, ns: u64) -> Result<(), Option<u64>> {
        if self.consume(ns) > 0 {
            return Ok(());
        }
        match self.next_run() {
            Some(0) => Ok(()),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Set { flag: u32 },
    Clear,
}

/// A controller write at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub at_ns: u64,
    pub pid: Pid,
    pub action: ControlAction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub nr_cpus: usize,
    pub duration_ns: u64,
    #[serde(default)]
    pub seed: u64,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub control: Vec<ControlEvent>,
}

impl Scenario {
    pub fn new(nr_cpus: usize, duration_ns: u64) -> Self {
        Self {
            nr_cpus,
            duration_ns,
            seed: 0,
            tasks: Vec::new(),
            control: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_control(mut self, at_ns: u64, pid: Pid, action: ControlAction) -> Self {
        self.control.push(ControlEvent { at_ns, pid, action });
        self
    }

    /// Mixed default workload for the loader: CPU hogs, interactive tasks, and
    /// one heavier task. `watched` PIDs are added as hogs so controller
    /// toggling has a visible effect.
    pub fn builtin(nr_cpus: usize, watched: &[Pid]) -> Self {
        let nr_cpus = nr_cpus.max(1);
        let mut scenario = Scenario::new(nr_cpus, u64::MAX);
        let mut pid: Pid = 1000;
        for _ in 0..nr_cpus {
            scenario.tasks.push(TaskSpec::hog(pid, DEFAULT_WEIGHT));
            scenario
                .tasks
                .push(TaskSpec::interactive(pid + 1, 2_000_000, 8_000_000));
            pid += 2;
        }
        scenario.tasks.push(TaskSpec::hog(pid, DEFAULT_WEIGHT * 2));
        for &w in watched {
            if scenario.tasks.iter().all(|t| t.pid != w) {
                scenario.tasks.push(TaskSpec::hog(w, DEFAULT_WEIGHT));
            }
        }
        scenario
    }

    /// Random scenario for property tests. Same seed, same scenario.
    pub fn random(seed: u64, max_cpus: u32, max_tasks: u32, duration_ns: u64) -> Self {
        let mut rng = SimRng::new(seed);
        let nr_cpus = rng.gen_range(1, max_cpus.max(1) + 1) as usize;
        let nr_tasks = rng.gen_range(1, max_tasks.max(1) + 1);
        let mut scenario = Scenario::new(nr_cpus, duration_ns);
        scenario.seed = seed;

        for i in 0..nr_tasks {
            let pid = 100 + i;
            let weight = if rng.chance(1, 4) {
                rng.gen_range(1, 1000)
            } else {
                DEFAULT_WEIGHT
            };
            let nr_phases = rng.gen_range(1, 4);
            let mut phases = Vec::with_capacity(nr_phases as usize * 2);
            for _ in 0..nr_phases {
                phases.push(Phase::Run {
                    ns: rng.gen_range_u64(100_000, 40_000_000),
                });
                if rng.chance(1, 2) {
                    phases.push(Phase::Sleep {
                        ns: rng.gen_range_u64(100_000, 30_000_000),
                    });
                }
            }
            scenario.tasks.push(TaskSpec {
                pid,
                weight,
                start_ns: rng.gen_range_u64(0, duration_ns / 4 + 1),
                phases,
                repeat: true,
                cgroup: None,
            });
        }

        let nr_writes = rng.gen_range(0, 6);
        for _ in 0..nr_writes {
            let pid = 100 + rng.gen_range(0, nr_tasks);
            let action = if rng.chance(1, 5) {
                ControlAction::Clear
            } else {
                ControlAction::Set {
                    flag: rng.gen_range(0, 2),
                }
            };
            scenario.control.push(ControlEvent {
                at_ns: rng.gen_range_u64(0, duration_ns.max(1)),
                pid,
                action,
            });
        }
        scenario.control.sort_by_key(|e| e.at_ns);
        scenario
    }

    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_json::from_str(json).map_err(ScenarioError::Parse)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let json = fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.nr_cpus == 0 {
            return Err(ScenarioError::NoCpus);
        }
        let mut seen = BTreeSet::new();
        for task in &self.tasks {
            if !seen.insert(task.pid) {
                return Err(ScenarioError::DuplicatePid(task.pid));
            }
            if task.weight == 0 || task.weight > MAX_WEIGHT {
                return Err(ScenarioError::BadWeight {
                    pid: task.pid,
                    weight: task.weight,
                });
            }
            let runs = task.phases.iter().any(|p| matches!(p, Phase::Run { .. }));
            let zero_run = task.phases.iter().any(|p| matches!(p, Phase::Run { ns: 0 }));
            if !runs || zero_run {
                return Err(ScenarioError::NoRunPhase(task.pid));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum ScenarioError {
    Io { path: PathBuf, source: io::Error },
    Parse(serde_json::Error),
    NoCpus,
    DuplicatePid(Pid),
    BadWeight { pid: Pid, weight: u32 },
    /// Every task needs at least one run phase, and none may be empty.
    NoRunPhase(Pid),
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed to read {}: {source}", path.display()),
            Self::Parse(err) => write!(f, "invalid scenario json: {err}"),
            Self::NoCpus => write!(f, "scenario needs at least one cpu"),
            Self::DuplicatePid(pid) => write!(f, "pid {pid} appears more than once"),
            Self::BadWeight { pid, weight } => {
                write!(f, "pid {pid}: weight {weight} outside 1..={MAX_WEIGHT}")
            }
            Self::NoRunPhase(pid) => write!(f, "pid {pid}: phases need a non-empty run phase"),
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_documented_format() {
        let json = r#"{
            "nr_cpus": 2,
            "duration_ns": 2000000000,
            "tasks": [
                { "pid": 100, "weight": 100, "phases": [{ "run": { "ns": 50000000 } }] },
                { "pid": 101, "phases": [{ "run": { "ns": 2000000 } }, { "sleep": { "ns": 8000000 } }] }
            ],
            "control": [{ "at_ns": 500000000, "pid": 100, "action": { "set": { "flag": 1 } } }]
        }"#;
        let s = Scenario::from_json(json).unwrap();
        assert_eq!(s.nr_cpus, 2);
        assert_eq!(s.tasks[1].weight, DEFAULT_WEIGHT);
        assert!(s.tasks[1].repeat);
        assert_eq!(s.control[0].action, ControlAction::Set { flag: 1 });
    }

    #[test]
    fn rejects_bad_scenarios() {
        let s = Scenario::new(1, 10)
            .with_task(TaskSpec::hog(1, 100))
            .with_task(TaskSpec::hog(1, 100));
        assert!(matches!(s.validate(), Err(ScenarioError::DuplicatePid(1))));

        let mut t = TaskSpec::hog(2, 100);
        t.phases = vec![Phase::Sleep { ns: 5 }];
        let s = Scenario::new(1, 10).with_task(t);
        assert!(matches!(s.validate(), Err(ScenarioError::NoRunPhase(2))));

        assert!(matches!(Scenario::new(0, 10).validate(), Err(ScenarioError::NoCpus)));
        assert!(matches!(
            Scenario::from_json("{"),
            Err(ScenarioError::Parse(_))
        ));
    }

    #[test]
    fn builtin_includes_watched_pids_once() {
        let s = Scenario::builtin(2, &[1000, 4242]);
        s.validate().unwrap();
        assert_eq!(s.tasks.iter().filter(|t| t.pid == 1000).count(), 1);
        assert!(s.tasks.iter().any(|t| t.pid == 4242));
    }

    #[test]
    fn cursor_accumulates_sleeps_and_wraps() {
        let spec = TaskSpec {
            pid: 1,
            weight: DEFAULT_WEIGHT,
            start_ns: 0,
            phases: vec![
                Phase::Sleep { ns: 3 },
                Phase::Run { ns: 10 },
                Phase::Sleep { ns: 4 },
                Phase::Sleep { ns: 5 },
            ],
            repeat: true,
            cgroup: None,
        };
        let mut cursor = PhaseCursor::new(&spec);
        assert_eq!(cursor.next_run(), Some(3));
        assert_eq!(cursor.run_left(), 10);
        assert_eq!(cursor.after_run(4), Ok(()));
        assert_eq!(cursor.after_run(6), Err(Some(12)));

        let mut once = PhaseCursor::new(&TaskSpec {
            repeat: false,
            ..spec
        });
        assert_eq!(once.next_run(), Some(3));
        assert_eq!(once.after_run(10), Err(None));
    }

    #[test]
    fn back_to_back_runs_stay_runnable() {
        let mut t = TaskSpec::hog(1, DEFAULT_WEIGHT);
        t.phases = vec![Phase::Run { ns: 5 }, Phase::Run { ns: 7 }];
        let mut cursor = PhaseCursor::new(&t);
        assert_eq!(cursor.next_run(), Some(0));
        assert_eq!(cursor.after_run(5), Ok(()));
        assert_eq!(cursor.run_left(), 7);
    }

    #[test]
    fn random_is_deterministic_and_valid() {
        let a = Scenario::random(7, 4, 8, 1_000_000_000);
        let b = Scenario::random(7, 4, 8, 1_000_000_000);
        assert_eq!(a, b);
        a.validate().unwrap();
        assert!(a.control.windows(2).all(|w| w[0].at_ns <= w[1].at_ns));
    }
}
