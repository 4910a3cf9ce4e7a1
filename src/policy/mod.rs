//! Scheduling policy contract and the controllable vtime policy.
//!
//! A policy is a closed set of callbacks the host invokes on scheduling
//! events. Callbacks for different tasks run concurrently on every CPU;
//! callbacks for one task are strictly ordered by the host:
//!
//! ```text
//! enable → [select_cpu] → (enqueue)? → dispatch… → running → stopping
//!            ↑                                                   │
//!            └──────── wakeup ◄── sleep ◄── !runnable ◄──────────┤
//!                                   enqueue ◄── runnable ◄───────┘
//! ```
//!
//! # Invariants
//! - No callback blocks or takes a lock shared with another CPU.
//! - A runnable task handed to `select_cpu`/`enqueue` is in exactly one queue
//!   when the callback returns. Hosts verify this and count violations.
//! - After `exit`, hosts stop invoking callbacks.

pub mod config;
pub mod engine;
pub mod exit;

pub use config::{ConfigError, PolicyConfig, SchedMode, SCX_SLICE_DFL, THROTTLED_SLICE};
pub use engine::CtrlPolicy;
pub use exit::{ExitInfo, ExitKind, ExitRecord, SCX_ECODE_ACT_RESTART, SCX_ECODE_RSN_HOTPLUG};

use std::fmt;
use std::sync::Arc;

use crate::ctrl_table::ProcessControlTable;
use crate::dsq::{DsqError, DsqId};
use crate::host::Host;
use crate::stats::Stats;
use crate::task::{CpuId, Task};
use crate::vtime::VtimeClock;

/// Shared state a policy exposes to its loader and host, the way a loaded
/// program exposes its maps.
#[derive(Clone, Copy)]
pub struct PolicyMaps<'a> {
    pub exit: &'a ExitRecord,
    pub stats: Option<&'a Stats>,
    pub control: Option<&'a ProcessControlTable>,
    pub vtime: Option<&'a VtimeClock>,
}

/// The callback contract between a host and a policy.
pub trait SchedulingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Creates the policy's queues. Failure aborts the attach.
    fn init(&self, host: &dyn Host) -> Result<(), PolicyError>;

    /// Picks a CPU for a waking task; may insert it directly.
    fn select_cpu(&self, host: &dyn Host, task: &Arc<Task>, prev_cpu: CpuId, wake_flags: u64)
        -> CpuId;

    /// Queues a runnable task that `select_cpu` did not place.
    fn enqueue(&self, host: &dyn Host, task: &Arc<Task>, enq_flags: u64);

    /// Refills `cpu`'s local queue; `prev` is the task that just ran there.
    fn dispatch(&self, host: &dyn Host, cpu: CpuId, prev: Option<&Arc<Task>>);

    fn running(&self, task: &Task);

    fn stopping(&self, task: &Task, runnable: bool);

    /// The task joined this policy.
    fn enable(&self, task: &Task);

    /// Teardown. Only the first call is recorded.
    fn exit(&self, info: ExitInfo);

    fn maps(&self) -> PolicyMaps<'_>;
}

#[derive(Debug)]
#[non_exhaustive]
pub enum PolicyError {
    DsqCreate { id: DsqId, source: DsqError },
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DsqCreate { id, source } => write!(f, "failed to create dsq {id:#x}: {source}"),
        }
    }
}

impl std::error::Error for PolicyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DsqCreate { source, .. } => Some(source),
        }
    }
}
