//! Host side of the policy boundary.
//!
//! The policy never owns CPUs or tasks. A host marshals scheduling events
//! (wakeups, slice expiry, CPUs running dry) into [`SchedulingPolicy`]
//! callbacks and exposes the few helpers the policy may call back into:
//! default idle-CPU selection, the dispatch queue store, and read-only
//! diagnostics.
//!
//! Two hosts exist:
//! - [`crate::sim::SimHost`]: single-threaded discrete-event host for
//!   deterministic tests.
//! - [`emu::EmuHost`]: one OS thread per emulated CPU, used by the loader.
//!
//! [`SchedulingPolicy`]: crate::policy::SchedulingPolicy

pub mod cpumask;
pub mod current_cpu;
pub mod emu;

pub use cpumask::IdleMask;
pub use emu::{AttachError, AttachHandle, EmuConfig, EmuHost};

use serde::{Deserialize, Serialize};

use crate::dsq::DsqStore;
use crate::task::{CpuId, Task};

/// Enqueue flag: the task is being enqueued because it woke up.
pub const SCX_ENQ_WAKEUP: u64 = 1;

/// Wake flag: wakeup from `try_to_wake_up`.
pub const SCX_WAKE_TTWU: u64 = 0x08;
/// Wake flag: the task is newly forked.
pub const SCX_WAKE_FORK: u64 = 0x04;

/// Control-group metadata a host can report for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupInfo {
    pub id: u64,
    pub level: u32,
    pub name: String,
}

/// Services a host offers to the policy during callbacks.
pub trait Host: Send + Sync {
    fn nr_cpus(&self) -> usize;

    /// Queue store the policy inserts into and dispatches from.
    fn dsq(&self) -> &DsqStore;

    /// CPU executing the current callback.
    fn current_cpu(&self) -> CpuId;

    /// Default CPU choice for a waking task: `prev_cpu` if idle, else any idle
    /// CPU, else `prev_cpu`. Returns `(cpu, is_idle)`; when `is_idle` the CPU
    /// has been claimed and will not be handed to another waker.
    fn select_cpu_dfl(&self, task: &Task, prev_cpu: CpuId, wake_flags: u64) -> (CpuId, bool);

    /// Diagnostic cgroup lookup.
    fn task_cgroup(&self, _task: &Task) -> Option<CgroupInfo> {
        None
    }
}
