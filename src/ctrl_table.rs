//! Fixed-capacity PID → throttling-flag table shared with the controller.
//!
//! The policy looks up a task's PID on every wakeup, enqueue, and dispatch, so
//! reads must never block and must be bounded. The controller writes a handful
//! of entries per second. The table is therefore an open-addressed array of
//! packed `AtomicU64` slots: readers probe it with plain atomic loads, writers
//! take a writer-only mutex.
//!
//! # Slot layout
//! ```text
//! [63 ............ 32][31 ...... 2][1..0]
//!        pid             unused      tag
//! ```
//! Tags: `EMPTY` (never used), `RUNNING`, `STOPPED`, `TOMBSTONE` (removed).
//! A slot is written with one atomic store, so a reader sees either the old or
//! the new `(pid, flag)` pair, never a mix.
//!
//! # Invariants
//! - The slot count is a power of two, at least `2 × max_entries`, so the load
//!   factor of live entries stays at or below one half.
//! - A PID occupies at most one non-empty slot. Writers are serialized and
//!   scan the whole probe chain before claiming a slot.
//! - A removed entry becomes a `TOMBSTONE` so later chain members stay
//!   reachable. When the slot after it is `EMPTY`, no chain continues past it,
//!   so the removal and the tombstones directly before it revert to `EMPTY`.
//!   Tombstones only survive ahead of a live entry, and a miss on an empty
//!   table stops at its home slot.
//!
//! # Ordering
//! Writers publish with `Release`, readers load with `Acquire`. A reader racing
//! with a writer may see the previous state of that PID; the policy tolerates
//! one stale decision.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
#[cfg(loom)]
use loom::sync::Mutex;
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
#[cfg(not(loom))]
use std::sync::Mutex;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::Pid;

/// Default capacity, matching the controller's historical map size.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Flag value the controller writes for a process allowed to run normally.
pub const FLAG_RUNNING: u32 = 0;
/// Flag value the controller writes for a process to be throttled.
pub const FLAG_STOPPED: u32 = 1;

const TAG_EMPTY: u64 = 0;
const TAG_RUNNING: u64 = 1;
const TAG_STOPPED: u64 = 2;
const TAG_TOMBSTONE: u64 = 3;
const TAG_MASK: u64 = 0b11;

const HASH_MUL: u64 = 0x9E37_79B9_7F4A_7C15;

#[inline(always)]
fn pack(pid: Pid, tag: u64) -> u64 {
    ((pid as u64) << 32) | tag
}

#[inline(always)]
fn slot_pid(word: u64) -> Pid {
    (word >> 32) as Pid
}

#[inline(always)]
fn slot_tag(word: u64) -> u64 {
    word & TAG_MASK
}

/// What the policy should do with a PID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlState {
    Running,
    Stopped,
    NotTracked,
}

impl ControlState {
    /// Maps a controller flag to a state; `None` for unknown flags.
    pub fn from_flag(flag: u32) -> Option<Self> {
        match flag {
            FLAG_RUNNING => Some(ControlState::Running),
            FLAG_STOPPED => Some(ControlState::Stopped),
            _ => None,
        }
    }

    pub fn flag(self) -> Option<u32> {
        match self {
            ControlState::Running => Some(FLAG_RUNNING),
            ControlState::Stopped => Some(FLAG_STOPPED),
            ControlState::NotTracked => None,
        }
    }

    #[inline(always)]
    pub fn is_tracked(self) -> bool {
        !matches!(self, ControlState::NotTracked)
    }

    #[inline(always)]
    pub fn is_stopped(self) -> bool {
        matches!(self, ControlState::Stopped)
    }

    fn tag(self) -> u64 {
        match self {
            ControlState::Running => TAG_RUNNING,
            ControlState::Stopped => TAG_STOPPED,
            ControlState::NotTracked => TAG_TOMBSTONE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ControlTableError {
    /// Flag other than [`FLAG_RUNNING`] or [`FLAG_STOPPED`].
    InvalidFlag { pid: Pid, flag: u32 },
    /// A new PID was written while `max_entries` PIDs are already tracked.
    Full { max_entries: usize },
}

impl fmt::Display for ControlTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFlag { pid, flag } => {
                write!(f, "invalid control flag {flag} for pid {pid} (expected 0 or 1)")
            }
            Self::Full { max_entries } => {
                write!(f, "control table full ({max_entries} entries)")
            }
        }
    }
}

impl std::error::Error for ControlTableError {}

/// PID-keyed control map. See the module docs for the layout.
pub struct ProcessControlTable {
    slots: Box<[AtomicU64]>,
    mask: usize,
    max_entries: usize,
    live: AtomicUsize,
    writer: Mutex<()>,
}

impl ProcessControlTable {
    /// # Panics
    ///
    /// Panics if `max_entries` is zero.
    pub fn new(max_entries: usize) -> Self {
        assert!(max_entries > 0, "control table requires max_entries > 0");
        let nr_slots = (max_entries * 2).next_power_of_two();
        let slots = (0..nr_slots).map(|_| AtomicU64::new(TAG_EMPTY)).collect();
        Self {
            slots,
            mask: nr_slots - 1,
            max_entries,
            live: AtomicUsize::new(0),
            writer: Mutex::new(()),
        }
    }

    #[inline(always)]
    fn home_slot(&self, pid: Pid) -> usize {
        ((pid as u64).wrapping_mul(HASH_MUL) >> 32) as usize & self.mask
    }

    /// Lock-free lookup.
    #[inline]
    pub fn get(&self, pid: Pid) -> ControlState {
        let mut idx = self.home_slot(pid);
        for _ in 0..self.slots.len() {
            let word = self.slots[idx].load(Ordering::Acquire);
            match slot_tag(word) {
                TAG_EMPTY => return ControlState::NotTracked,
                tag if slot_pid(word) == pid => {
                    return match tag {
                        TAG_RUNNING => ControlState::Running,
                        TAG_STOPPED => ControlState::Stopped,
                        _ => ControlState::NotTracked,
                    };
                }
                _ => {}
            }
            idx = (idx + 1) & self.mask;
        }
        ControlState::NotTracked
    }

    /// Inserts or updates `pid` with a controller flag.
    pub fn set(&self, pid: Pid, flag: u32) -> Result<(), ControlTableError> {
        let state =
            ControlState::from_flag(flag).ok_or(ControlTableError::InvalidFlag { pid, flag })?;
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let mut idx = self.home_slot(pid);
        let mut reusable = None;
        for _ in 0..self.slots.len() {
            let word = self.slots[idx].load(Ordering::Relaxed);
            let tag = slot_tag(word);
            if tag == TAG_EMPTY {
                reusable.get_or_insert(idx);
                break;
            }
            if slot_pid(word) == pid {
                if tag == TAG_TOMBSTONE {
                    // Reviving a removed PID counts as a new entry.
                    reusable = Some(idx);
                    break;
                }
                self.slots[idx].store(pack(pid, state.tag()), Ordering::Release);
                return Ok(());
            }
            if tag == TAG_TOMBSTONE && reusable.is_none() {
                reusable = Some(idx);
            }
            idx = (idx + 1) & self.mask;
        }

        if self.live.load(Ordering::Relaxed) >= self.max_entries {
            return Err(ControlTableError::Full {
                max_entries: self.max_entries,
            });
        }
        // Live entries are at most half the slots, so a free slot exists.
        let Some(slot) = reusable else {
            return Err(ControlTableError::Full {
                max_entries: self.max_entries,
            });
        };
        self.slots[slot].store(pack(pid, state.tag()), Ordering::Release);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes `pid`; returns whether it was tracked.
    pub fn clear(&self, pid: Pid) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let mut idx = self.home_slot(pid);
        for _ in 0..self.slots.len() {
            let word = self.slots[idx].load(Ordering::Relaxed);
            let tag = slot_tag(word);
            if tag == TAG_EMPTY {
                return false;
            }
            if slot_pid(word) == pid {
                if tag == TAG_TOMBSTONE {
                    return false;
                }
                self.slots[idx].store(pack(pid, TAG_TOMBSTONE), Ordering::Release);
                self.live.fetch_sub(1, Ordering::Relaxed);
                self.reclaim_tombstones(idx);
                return true;
            }
            idx = (idx + 1) & self.mask;
        }
        false
    }

    /// Reverts the tombstone run ending at `last` to `EMPTY` if the slot after
    /// it is `EMPTY`. Caller holds the writer lock.
    fn reclaim_tombstones(&self, last: usize) {
        let next = (last + 1) & self.mask;
        if slot_tag(self.slots[next].load(Ordering::Relaxed)) != TAG_EMPTY {
            return;
        }
        let mut idx = last;
        for _ in 0..self.slots.len() {
            let word = self.slots[idx].load(Ordering::Relaxed);
            if slot_tag(word) != TAG_TOMBSTONE {
                break;
            }
            self.slots[idx].store(TAG_EMPTY, Ordering::Release);
            idx = idx.wrapping_sub(1) & self.mask;
        }
    }

    /// Number of tracked PIDs.
    #[inline]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Snapshot of tracked PIDs, sorted by PID.
    pub fn entries(&self) -> Vec<(Pid, ControlState)> {
        let mut out: Vec<_> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let word = slot.load(Ordering::Acquire);
                match slot_tag(word) {
                    TAG_RUNNING => Some((slot_pid(word), ControlState::Running)),
                    TAG_STOPPED => Some((slot_pid(word), ControlState::Stopped)),
                    _ => None,
                }
            })
            .collect();
        out.sort_unstable_by_key(|&(pid, _)| pid);
        out
    }
}

impl Default for ProcessControlTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl fmt::Debug for ProcessControlTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessControlTable")
            .field("len", &self.len())
            .field("capacity", &self.max_entries)
            .field("slots", &self.slots.len())
            .finish()
    }
}


#[cfg(loom)]
mod loom_tests {
    use super::*;
    use loom::thread;

    /// A reader racing a flag flip sees either the old or the new flag.
    #[test]
    fn reader_sees_old_or_new_flag() {
        loom::model(|| {
            let table = std::sync::Arc::new(ProcessControlTable::new(2));
            table.set(5, FLAG_RUNNING).unwrap();
            let t2 = table.clone();

            let h = thread::spawn(move || t2.set(5, FLAG_STOPPED).unwrap());
            let seen = table.get(5);
            h.join().unwrap();

            assert!(matches!(seen, ControlState::Running | ControlState::Stopped));
            assert_eq!(table.get(5), ControlState::Stopped);
        });
    }

    /// Two writers on distinct PIDs serialize without losing either entry.
    #[test]
    fn concurrent_writers_both_land() {
        loom::model(|| {
            let table = std::sync::Arc::new(ProcessControlTable::new(2));
            let t2 = table.clone();

            let h = thread::spawn(move || t2.set(1, FLAG_STOPPED).unwrap());
            table.set(2, FLAG_RUNNING).unwrap();
            h.join().unwrap();

            assert_eq!(table.get(1), ControlState::Stopped);
            assert_eq!(table.get(2), ControlState::Running);
            assert_eq!(table.len(), 2);
        });
    }

    /// Removing the head of a chain never hides the entry behind it.
    #[test]
    fn clear_keeps_later_chain_members_visible() {
        loom::model(|| {
            let table = std::sync::Arc::new(ProcessControlTable::new(2));
            let head = 1;
            let tail = (2..)
                .find(|&pid| table.home_slot(pid) == table.home_slot(head))
                .unwrap();
            table.set(head, FLAG_RUNNING).unwrap();
            table.set(tail, FLAG_STOPPED).unwrap();
            let t2 = table.clone();

            let h = thread::spawn(move || assert!(t2.clear(head)));
            assert_eq!(table.get(tail), ControlState::Stopped);
            h.join().unwrap();

            assert!(table.clear(tail));
            assert_eq!(table.get(head), ControlState::NotTracked);
            assert!(table.is_empty());
        });
    }
}
