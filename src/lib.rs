//! Controllable weighted-vtime CPU scheduling policy.
//!
//! ## Scope
//! A pluggable scheduling policy in the shape of a sched_ext program: a closed
//! set of callbacks (`select_cpu`, `enqueue`, `dispatch`, `running`,
//! `stopping`, `enable`, `exit`) that decide where waking tasks run, how
//! runnable tasks are ordered, and how CPU time entitlement is tracked. An
//! external controller can mark individual processes STOPPED through a
//! fixed-capacity control table; stopped processes get short slices and a
//! low-priority queue, but are never dropped.
//!
//! ## Key invariants
//! - A runnable task handed to `select_cpu`/`enqueue` is queued exactly once
//!   when the callback returns.
//! - The global vtime clock never moves backwards (wrap-safe comparison).
//! - A waking task's vtime is never more than one slice behind the clock.
//! - No callback takes a lock shared with other CPUs.
//!
//! ## Event flow
//! `wakeup -> select_cpu -> (enqueue) -> dispatch -> running -> stopping -> (enqueue | sleep)`
//!
//! ## Notable entry points
//! - [`CtrlPolicy`] / [`PolicyConfig`]: the policy and its tunables.
//! - [`SchedulingPolicy`] / [`host::Host`]: the callback contract.
//! - [`host::EmuHost`]: threaded host with one OS thread per emulated CPU.
//! - [`sim::SimRunner`]: deterministic discrete-event host with oracles.
//! - [`loader::Loader`]: attach, stats polling, controller, restart.

pub mod ctrl_table;
pub mod dsq;
pub mod host;
pub mod loader;
pub mod policy;
pub mod sim;
pub mod stats;
pub mod task;
#[cfg(test)]
pub mod test_utils;
pub mod vtime;
pub mod workload;

pub use ctrl_table::{ControlState, ControlTableError, ProcessControlTable};
pub use dsq::{DsqError, DsqId, DsqKind, DsqStore, SHARED_DSQ, THROTTLE_DSQ};
pub use policy::{
    CtrlPolicy, ExitInfo, ExitKind, PolicyConfig, PolicyError, SchedMode, SchedulingPolicy,
};
pub use stats::{StatIdx, Stats, StatsSnapshot};
pub use task::{CpuId, Pid, Task};
pub use vtime::{time_before, VtimeClock};
