//! Dispatch queues.
//!
//! Three kinds of queue hold runnable tasks between decisions:
//!
//! - the **shared** queue ([`SHARED_DSQ`]), fed by `enqueue` and drained by
//!   every CPU's `dispatch`;
//! - the **throttle** queue ([`THROTTLE_DSQ`]), holding stopped tasks diverted
//!   out of the shared queue (control variant only);
//! - one **local** FIFO per CPU, consumed only by that CPU.
//!
//! Shared queues are either FIFO or ordered by `(vtime, insertion seq)`; the
//! kind is fixed when the queue is created. See [`store`] for the concurrency
//! model.

pub mod store;

pub use store::{DsqStore, MoveOutcome};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a shared dispatch queue.
pub type DsqId = u64;

/// The queue every CPU dispatches from.
pub const SHARED_DSQ: DsqId = 0;

/// Holding queue for throttled tasks.
pub const THROTTLE_DSQ: DsqId = 4;

/// IDs with this bit set name framework built-ins and cannot be created.
pub const DSQ_FLAG_BUILTIN: DsqId = 1 << 63;

/// Ordering discipline of a shared queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DsqKind {
    Fifo,
    Vtime,
}

impl fmt::Display for DsqKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DsqKind::Fifo => "fifo",
            DsqKind::Vtime => "vtime",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DsqError {
    /// A queue with this ID already exists.
    Exists { id: DsqId, kind: DsqKind },
    /// The ID is in the built-in range.
    Reserved { id: DsqId },
    /// CPU index outside `0..nr_cpus`.
    InvalidCpu { cpu: u32, nr_cpus: usize },
    /// No queue with this ID.
    NotFound { id: DsqId },
}

impl fmt::Display for DsqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists { id, kind } => write!(f, "dsq {id:#x} already exists ({kind})"),
            Self::Reserved { id } => write!(f, "dsq id {id:#x} is reserved"),
            Self::InvalidCpu { cpu, nr_cpus } => {
                write!(f, "cpu {cpu} out of range (nr_cpus={nr_cpus})")
            }
            Self::NotFound { id } => write!(f, "dsq {id:#x} not found"),
        }
    }
}

impl std::error::Error for DsqError {}
