//! Deterministic simulation of a machine running a scheduling policy.
//!
//! - `SimClock` is monotonic and moves only when the event loop jumps to the
//!   next event.
//! - `SimRng` is deterministic and remaps a zero seed to a non-zero state.
//! - `TraceRing` never exceeds its capacity and evicts oldest events first.
//! - `SimRunner` replays a `Scenario` against a policy on a `SimHost` and
//!   checks placement, ownership, clock, and fairness oracles.

pub mod clock;
pub mod host;
pub mod rng;
pub mod runner;
pub mod trace;

pub use clock::SimClock;
pub use host::SimHost;
pub use rng::SimRng;
pub use runner::{
    FailureKind, FailureReport, RunOutcome, SimConfig, SimReport, SimRunner, INV_CLOCK_REGRESSED,
    INV_DOUBLE_QUEUED, INV_MISROUTE, INV_UNPLACED,
};
pub use trace::{TraceEvent, TraceRing};
