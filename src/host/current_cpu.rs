//! Thread-local emulated CPU ID.
//!
//! Emulated CPU threads set their ID at startup via `set_current_cpu(Some(id))`
//! so callbacks can attribute per-CPU counters to the CPU running them. Any
//! other thread (the waker, the loader, tests) sees `None`, and the host
//! substitutes the woken task's previous CPU.
//!
//! CPU threads clear the slot before exit so a reused thread never reports a
//! stale CPU.

use std::cell::Cell;

use crate::task::CpuId;

const NO_CPU: u32 = u32::MAX;

thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(NO_CPU) };
}

#[inline]
pub fn set_current_cpu(cpu: Option<CpuId>) {
    CURRENT_CPU.with(|c| c.set(cpu.map_or(NO_CPU, CpuId::as_u32)));
}

#[inline]
pub fn current_cpu() -> Option<CpuId> {
    CURRENT_CPU.with(|c| {
        let v = c.get();
        (v != NO_CPU).then(|| CpuId::from_u32(v))
    })
}
