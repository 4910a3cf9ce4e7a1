//! Lock-free dispatch queue store.
//!
//! # Structure
//! - Shared queues live in a `SkipMap<DsqId, DispatchQueue>` so lookups from
//!   every CPU are lock-free. A vtime queue is itself a
//!   `SkipMap<DsqKey, Arc<Task>>`; a FIFO queue is a `SegQueue`.
//! - Local queues are one cache-padded `SegQueue` per CPU. Any CPU may push
//!   (wakeup placement runs on the waker's CPU); only the owner pops.
//!
//! # Invariants
//! - A task is in at most one queue. [`DsqStore::insert`] and
//!   [`DsqStore::insert_local`] set the task's queued mark; popping from a
//!   local queue or [`DsqStore::pop_front`] clears it. Moving a task between
//!   queues keeps it marked for the whole move.
//! - Nothing is dropped. Inserting into an unknown queue falls back to the
//!   shared queue, then to CPU 0's local queue, and is counted as a misroute.
//! - Within a vtime queue, ties on vtime break by a store-wide insertion
//!   sequence number, so equal keys dequeue in insertion order.
//!
//! # Performance
//! Insert and pop are O(log n) for vtime queues and O(1) amortized for FIFO
//! and local queues. No operation takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use crossbeam_skiplist::SkipMap;
use crossbeam_utils::CachePadded;
use log::{debug, error};

use super::{DsqError, DsqId, DsqKind, DSQ_FLAG_BUILTIN, SHARED_DSQ};
use crate::task::{CpuId, Task};

/// Sort key of a vtime queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DsqKey {
    vtime: u64,
    seq: u64,
}

enum Entries {
    Fifo(SegQueue<Arc<Task>>),
    Vtime(SkipMap<DsqKey, Arc<Task>>),
}

struct DispatchQueue {
    kind: DsqKind,
    entries: Entries,
}

impl DispatchQueue {
    fn new(kind: DsqKind) -> Self {
        let entries = match kind {
            DsqKind::Fifo => Entries::Fifo(SegQueue::new()),
            DsqKind::Vtime => Entries::Vtime(SkipMap::new()),
        };
        Self { kind, entries }
    }

    /// Appends `task`. `vtime` is honoured only by vtime queues; a missing
    /// key lands at the current tail.
    fn push(&self, task: Arc<Task>, vtime: Option<u64>, seq: u64) {
        match &self.entries {
            Entries::Fifo(q) => q.push(task),
            Entries::Vtime(map) => {
                let vtime = match vtime {
                    Some(v) => v,
                    None => map.back().map_or(0, |e| e.key().vtime),
                };
                task.set_dsq_vtime(vtime);
                map.insert(DsqKey { vtime, seq }, task);
            }
        }
    }

    fn pop(&self) -> Option<(Arc<Task>, Option<u64>)> {
        match &self.entries {
            Entries::Fifo(q) => q.pop().map(|t| (t, None)),
            Entries::Vtime(map) => map
                .pop_front()
                .map(|e| (Arc::clone(e.value()), Some(e.key().vtime))),
        }
    }

    fn len(&self) -> usize {
        match &self.entries {
            Entries::Fifo(q) => q.len(),
            Entries::Vtime(map) => map.len(),
        }
    }

    fn front_key(&self) -> Option<u64> {
        match &self.entries {
            Entries::Fifo(_) => None,
            Entries::Vtime(map) => map.front().map(|e| e.key().vtime),
        }
    }
}

/// Result of [`DsqStore::divert_head`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The head was moved to the CPU's local queue.
    Moved,
    /// The head was moved to the divert queue.
    Diverted,
    /// The source queue was empty.
    Empty,
}

/// All dispatch queues of one policy instance.
pub struct DsqStore {
    shared: SkipMap<DsqId, DispatchQueue>,
    local: Box<[CachePadded<SegQueue<Arc<Task>>>]>,
    seq: AtomicU64,
    misroutes: AtomicU64,
    double_inserts: AtomicU64,
}

impl DsqStore {
    /// # Panics
    ///
    /// Panics if `nr_cpus` is zero.
    pub fn new(nr_cpus: usize) -> Self {
        assert!(nr_cpus > 0, "DsqStore requires at least one CPU");
        Self {
            shared: SkipMap::new(),
            local: (0..nr_cpus).map(|_| CachePadded::new(SegQueue::new())).collect(),
            seq: AtomicU64::new(0),
            misroutes: AtomicU64::new(0),
            double_inserts: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.local.len()
    }

    /// Creates a shared queue.
    pub fn create(&self, id: DsqId, kind: DsqKind) -> Result<(), DsqError> {
        if id & DSQ_FLAG_BUILTIN != 0 {
            return Err(DsqError::Reserved { id });
        }
        let mut created = false;
        let entry = self.shared.get_or_insert_with(id, || {
            created = true;
            DispatchQueue::new(kind)
        });
        if created {
            debug!("created dsq {id:#x} ({kind})");
            Ok(())
        } else {
            Err(DsqError::Exists {
                id,
                kind: entry.value().kind,
            })
        }
    }

    pub fn kind(&self, id: DsqId) -> Option<DsqKind> {
        self.shared.get(&id).map(|e| e.value().kind)
    }

    #[inline]
    fn check_cpu(&self, cpu: CpuId) -> Result<(), DsqError> {
        if cpu.index() < self.local.len() {
            Ok(())
        } else {
            Err(DsqError::InvalidCpu {
                cpu: cpu.as_u32(),
                nr_cpus: self.local.len(),
            })
        }
    }

    #[inline]
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn mark(&self, task: &Task) {
        if task.mark_queued() {
            debug_assert!(false, "pid {} inserted while already queued", task.pid());
            self.double_inserts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pushes onto a shared queue without touching the queued mark.
    fn push_shared(&self, id: DsqId, task: Arc<Task>, vtime: Option<u64>) {
        let seq = self.next_seq();
        if let Some(entry) = self.shared.get(&id) {
            entry.value().push(task, vtime, seq);
            return;
        }
        error!("pid {} inserted into unknown dsq {id:#x}; using shared dsq", task.pid());
        self.misroutes.fetch_add(1, Ordering::Relaxed);
        match self.shared.get(&SHARED_DSQ) {
            Some(entry) => entry.value().push(task, vtime, seq),
            None => self.local[0].push(task),
        }
    }

    /// Pushes onto a local queue without touching the queued mark.
    fn push_local(&self, cpu: CpuId, task: Arc<Task>) {
        match self.local.get(cpu.index()) {
            Some(q) => q.push(task),
            None => {
                error!("pid {} inserted into local dsq of invalid {cpu}", task.pid());
                self.misroutes.fetch_add(1, Ordering::Relaxed);
                self.push_shared(SHARED_DSQ, task, None);
            }
        }
    }

    /// Inserts `task` into shared queue `id` with a fresh `slice`.
    ///
    /// For vtime queues `vtime` becomes the task's `dsq_vtime`.
    pub fn insert(&self, id: DsqId, task: &Arc<Task>, vtime: Option<u64>, slice: u64) {
        task.set_slice(slice);
        self.mark(task);
        self.push_shared(id, Arc::clone(task), vtime);
    }

    /// Inserts `task` at the tail of `cpu`'s local queue.
    pub fn insert_local(&self, cpu: CpuId, task: &Arc<Task>, slice: u64) {
        task.set_slice(slice);
        self.mark(task);
        self.push_local(cpu, Arc::clone(task));
    }

    /// Removes the head of shared queue `id`.
    pub fn pop_front(&self, id: DsqId) -> Option<Arc<Task>> {
        let (task, _) = self.shared.get(&id)?.value().pop()?;
        task.mark_dequeued();
        Some(task)
    }

    /// Removes the head of `cpu`'s local queue.
    #[inline]
    pub fn pop_local(&self, cpu: CpuId) -> Option<Arc<Task>> {
        let task = self.local.get(cpu.index())?.pop()?;
        task.mark_dequeued();
        Some(task)
    }

    /// Moves the head of shared queue `from` to the tail of `cpu`'s local
    /// queue. Returns `false` if there was nothing to move.
    pub fn move_head(&self, from: DsqId, cpu: CpuId) -> bool {
        if let Err(err) = self.check_cpu(cpu) {
            error!("move_head from dsq {from:#x}: {err}");
            return false;
        }
        let Some(entry) = self.shared.get(&from) else {
            return false;
        };
        match entry.value().pop() {
            Some((task, _)) => {
                self.push_local(cpu, task);
                true
            }
            None => false,
        }
    }

    /// Takes the head of `from` and moves it either to `cpu`'s local queue or,
    /// if `divert` says so, to shared queue `to` with its order key intact.
    pub fn divert_head(
        &self,
        from: DsqId,
        cpu: CpuId,
        to: DsqId,
        divert: impl FnOnce(&Task) -> bool,
    ) -> MoveOutcome {
        if let Err(err) = self.check_cpu(cpu) {
            error!("divert_head from dsq {from:#x}: {err}");
            return MoveOutcome::Empty;
        }
        let Some(entry) = self.shared.get(&from) else {
            return MoveOutcome::Empty;
        };
        let Some((task, vtime)) = entry.value().pop() else {
            return MoveOutcome::Empty;
        };
        if divert(&task) {
            self.push_shared(to, task, vtime);
            MoveOutcome::Diverted
        } else {
            self.push_local(cpu, task);
            MoveOutcome::Moved
        }
    }

    pub fn len(&self, id: DsqId) -> Result<usize, DsqError> {
        self.shared
            .get(&id)
            .map(|e| e.value().len())
            .ok_or(DsqError::NotFound { id })
    }

    pub fn local_len(&self, cpu: CpuId) -> Result<usize, DsqError> {
        self.check_cpu(cpu)?;
        Ok(self.local[cpu.index()].len())
    }

    /// Order key at the head of a vtime queue.
    pub fn peek_key(&self, id: DsqId) -> Option<u64> {
        self.shared.get(&id)?.value().front_key()
    }

    /// Tasks queued anywhere in the store.
    pub fn total_queued(&self) -> usize {
        let shared: usize = self.shared.iter().map(|e| e.value().len()).sum();
        shared + self.local.iter().map(|q| q.len()).sum::<usize>()
    }

    /// Insertions that targeted a missing queue or CPU.
    pub fn misroutes(&self) -> u64 {
        self.misroutes.load(Ordering::Relaxed)
    }

    /// Insertions of a task that was already queued.
    pub fn double_inserts(&self) -> u64 {
        self.double_inserts.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DsqStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsqStore")
            .field("nr_cpus", &self.nr_cpus())
            .field("shared", &self.shared.len())
            .field("queued", &self.total_queued())
            .field("misroutes", &self.misroutes())
            .finish()
    }
}
