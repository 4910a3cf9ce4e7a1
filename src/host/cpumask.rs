//! Atomic idle-CPU mask.
//!
//! Bit `n` set means CPU `n` is idle and may be claimed by a waker. Claiming
//! is an atomic `fetch_and`, so exactly one caller wins each idle CPU; this is
//! what lets `select_cpu` insert straight into the chosen CPU's local queue
//! without another waker doing the same.
//!
//! # Ordering
//! `AcqRel` on the claim and `Release` on marking idle. A CPU marks itself idle
//! only after it found its local queue empty, and a winner inserts into the
//! local queue after claiming, so the CPU's next look at its queue (after being
//! unparked) observes the insertion.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, Ordering};

use crate::task::CpuId;

pub struct IdleMask {
    words: Box<[AtomicU64]>,
    nr_cpus: usize,
}

impl IdleMask {
    /// Creates a mask with every CPU busy.
    ///
    /// # Panics
    ///
    /// Panics if `nr_cpus` is zero.
    pub fn new(nr_cpus: usize) -> Self {
        assert!(nr_cpus > 0, "IdleMask requires nr_cpus > 0");
        let words = (0..nr_cpus.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words, nr_cpus }
    }

    #[inline(always)]
    fn locate(&self, cpu: CpuId) -> Option<(&AtomicU64, u64)> {
        let idx = cpu.index();
        if idx >= self.nr_cpus {
            return None;
        }
        Some((&self.words[idx / 64], 1u64 << (idx % 64)))
    }

    #[inline]
    pub fn set_idle(&self, cpu: CpuId) {
        if let Some((word, bit)) = self.locate(cpu) {
            word.fetch_or(bit, Ordering::Release);
        }
    }

    /// Marks `cpu` busy without claiming semantics.
    #[inline]
    pub fn clear(&self, cpu: CpuId) {
        if let Some((word, bit)) = self.locate(cpu) {
            word.fetch_and(!bit, Ordering::Release);
        }
    }

    #[inline]
    pub fn is_idle(&self, cpu: CpuId) -> bool {
        self.locate(cpu)
            .is_some_and(|(word, bit)| word.load(Ordering::Acquire) & bit != 0)
    }

    /// Claims `cpu` if it is idle. Exactly one concurrent caller wins.
    #[inline]
    pub fn test_and_clear(&self, cpu: CpuId) -> bool {
        match self.locate(cpu) {
            Some((word, bit)) => word.fetch_and(!bit, Ordering::AcqRel) & bit != 0,
            None => false,
        }
    }

    /// Claims the lowest-numbered idle CPU, if any.
    pub fn claim_any(&self) -> Option<CpuId> {
        for (w, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let idx = w * 64 + bits.trailing_zeros() as usize;
                let cpu = CpuId::from_index(idx);
                if self.test_and_clear(cpu) {
                    return Some(cpu);
                }
                bits &= bits - 1;
            }
        }
        None
    }

    /// Default idle selection shared by the hosts: `prev` if idle, else any
    /// idle CPU, else `prev` (not idle).
    pub fn select_dfl(&self, prev: CpuId) -> (CpuId, bool) {
        if self.test_and_clear(prev) {
            return (prev, true);
        }
        match self.claim_any() {
            Some(cpu) => (cpu, true),
            None => (prev, false),
        }
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

impl std::fmt::Debug for IdleMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleMask")
            .field("nr_cpus", &self.nr_cpus)
            .field("idle", &self.count())
            .finish()
    }
}


#[cfg(loom)]
mod loom_tests {
    use super::*;
    use loom::thread;

    /// Two wakers race for the only idle CPU; exactly one claims it.
    #[test]
    fn single_idle_cpu_claimed_once() {
        loom::model(|| {
            let mask = std::sync::Arc::new(IdleMask::new(2));
            mask.set_idle(CpuId::from_u32(1));
            let m2 = mask.clone();

            let h = thread::spawn(move || m2.select_dfl(CpuId::from_u32(0)).1);
            let main_idle = mask.select_dfl(CpuId::from_u32(0)).1;
            let thread_idle = h.join().unwrap();

            assert!(main_idle ^ thread_idle, "exactly one waker gets the idle CPU");
        });
    }
}
