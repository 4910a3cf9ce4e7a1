//! Global virtual-time clock.
//!
//! The clock is the policy's fairness reference: a single `u64` of weighted
//! nanoseconds that every CPU ratchets forward as tasks start running. Tasks
//! are ordered in the shared queue by their own virtual time, and a task that
//! slept for a long time is clamped to `clock - slice` on wakeup so it cannot
//! bank unbounded credit.
//!
//! # Invariants
//! - The stored value never moves backwards under the wrap-aware comparison
//!   [`time_before`]. Advancing is a CAS loop, so concurrent advances from
//!   different CPUs keep the largest candidate instead of the last writer.
//! - All arithmetic wraps. Comparisons are only meaningful for values within
//!   `2^63` of each other, which a nanosecond clock will not exceed.
//!
//! # Ordering
//! `Relaxed` everywhere. The clock publishes no other data; readers only need
//! an atomic snapshot of the counter itself.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Wrap-aware "a happens before b".
///
/// ```
/// use scx_ctrl::vtime::time_before;
///
/// assert!(time_before(1, 2));
/// assert!(!time_before(2, 2));
/// assert!(time_before(u64::MAX, 0)); // wrapped
/// ```
#[inline(always)]
pub fn time_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// Monotonic virtual-time counter shared by all CPUs.
pub struct VtimeClock {
    now: CachePadded<AtomicU64>,
}

impl VtimeClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(vtime: u64) -> Self {
        Self {
            now: CachePadded::new(AtomicU64::new(vtime)),
        }
    }

    #[inline(always)]
    pub fn read(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    /// Moves the clock to `candidate` if it lies strictly after the current
    /// value. Returns whether this call advanced the clock.
    #[inline]
    pub fn advance_if_greater(&self, candidate: u64) -> bool {
        let mut cur = self.now.load(Ordering::Relaxed);
        while time_before(cur, candidate) {
            match self.now.compare_exchange_weak(
                cur,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
        false
    }

    /// Limits how far behind the clock `vtime` may be: anything older than
    /// `clock - budget` is raised to exactly that floor.
    #[inline]
    pub fn clamp_floor(&self, vtime: u64, budget: u64) -> u64 {
        let floor = self.read().wrapping_sub(budget);
        if time_before(vtime, floor) {
            floor
        } else {
            vtime
        }
    }
}

impl Default for VtimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VtimeClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VtimeClock").field("now", &self.read()).finish()
    }
}


#[cfg(loom)]
mod loom_tests {
    use super::*;
    use loom::thread;

    /// Two CPUs ratchet concurrently; the larger candidate must survive.
    #[test]
    fn racing_advances_keep_larger() {
        loom::model(|| {
            let clock = std::sync::Arc::new(VtimeClock::new());
            let c2 = clock.clone();

            let h = thread::spawn(move || c2.advance_if_greater(20));
            let main_won = clock.advance_if_greater(10);
            let thread_won = h.join().unwrap();

            assert_eq!(clock.read(), 20);
            assert!(thread_won, "the larger candidate always advances");
            let _ = main_won;
        });
    }

    /// A reader never observes the clock going backwards.
    #[test]
    fn reader_sees_monotonic_values() {
        loom::model(|| {
            let clock = std::sync::Arc::new(VtimeClock::new());
            let c2 = clock.clone();

            let h = thread::spawn(move || {
                c2.advance_if_greater(5);
                c2.advance_if_greater(9);
            });
            let first = clock.read();
            let second = clock.read();
            h.join().unwrap();

            assert!(!time_before(second, first));
            assert_eq!(clock.read(), 9);
        });
    }
}
