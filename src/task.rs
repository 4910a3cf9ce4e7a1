//! Host-owned task state visible to the policy.
//!
//! A [`Task`] is created and owned by the host. The policy receives shared
//! references (`Arc<Task>`) in its callbacks and may store them in dispatch
//! queues, but it only ever writes the fields it owns:
//!
//! - `dsq_vtime`: written by the policy between `enable` and task exit, and by
//!   the queue store when a task is inserted into a vtime-ordered queue.
//! - `slice`: written by the queue store on insertion (the granted slice) and
//!   by the host as the task consumes CPU time (the remaining slice).
//!
//! # Invariants
//! - A task is in at most one dispatch queue at a time. The `queued` flag is set
//!   by the queue store on insertion and cleared when the owning CPU pops it.
//! - `weight` is in `1..=MAX_WEIGHT` and never changes after construction.
//!
//! All fields use `Relaxed` atomics: callbacks for one task are strictly
//! ordered by the host, so the atomics only exist to make the type `Sync`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process identifier as seen by the controller (key of the control table).
pub type Pid = u32;

/// Default scheduling weight (nice 0).
pub const DEFAULT_WEIGHT: u32 = 100;

/// Largest weight the host hands out (nice -20 maps to roughly 88761 in the
/// kernel, but the extension framework rescales into `1..=10000`).
pub const MAX_WEIGHT: u32 = 10_000;

/// Stable CPU identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpuId(u32);

impl CpuId {
    #[inline(always)]
    pub const fn from_u32(id: u32) -> Self {
        Self(id)
    }

    #[inline(always)]
    pub fn from_index(idx: usize) -> Self {
        debug_assert!(idx <= u32::MAX as usize);
        Self(idx as u32)
    }

    #[inline(always)]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// A schedulable entity.
pub struct Task {
    pid: Pid,
    weight: u32,
    dsq_vtime: AtomicU64,
    slice: AtomicU64,
    queued: AtomicBool,
}

impl Task {
    /// Creates a task. `weight` is clamped into `1..=MAX_WEIGHT`.
    pub fn new(pid: Pid, weight: u32) -> Self {
        Self {
            pid,
            weight: weight.clamp(1, MAX_WEIGHT),
            dsq_vtime: AtomicU64::new(0),
            slice: AtomicU64::new(0),
            queued: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline(always)]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Virtual time the task is (or will be) queued at.
    #[inline(always)]
    pub fn dsq_vtime(&self) -> u64 {
        self.dsq_vtime.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_dsq_vtime(&self, vtime: u64) {
        self.dsq_vtime.store(vtime, Ordering::Relaxed);
    }

    /// Adds `delta` to the task's virtual time (wrapping, like all vtime math).
    #[inline(always)]
    pub fn charge_vtime(&self, delta: u64) {
        self.dsq_vtime.fetch_add(delta, Ordering::Relaxed);
    }

    /// Remaining slice in nanoseconds.
    #[inline(always)]
    pub fn slice(&self) -> u64 {
        self.slice.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_slice(&self, slice_ns: u64) {
        self.slice.store(slice_ns, Ordering::Relaxed);
    }

    /// Consumes up to `ran_ns` of the remaining slice and returns what is left.
    #[inline]
    pub fn consume_slice(&self, ran_ns: u64) -> u64 {
        let left = self.slice().saturating_sub(ran_ns);
        self.set_slice(left);
        left
    }

    /// Whether the task currently sits in a dispatch queue.
    #[inline(always)]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Relaxed)
    }

    /// Marks the task queued; returns the previous value.
    #[inline(always)]
    pub(crate) fn mark_queued(&self) -> bool {
        self.queued.swap(true, Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn mark_dequeued(&self) {
        self.queued.store(false, Ordering::Relaxed);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("weight", &self.weight)
            .field("dsq_vtime", &self.dsq_vtime())
            .field("slice", &self.slice())
            .field("queued", &self.is_queued())
            .finish()
    }
}
