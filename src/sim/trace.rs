//! Bounded event trace for failure forensics and replay comparison.

use std::collections::VecDeque;

use crate::policy::ExitKind;
use crate::task::Pid;

/// One scheduling event, timestamped in simulated nanoseconds.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TraceEvent {
    /// Task woke; `direct` when `select_cpu` placed it on an idle CPU.
    Wake { t: u64, pid: Pid, cpu: u32, direct: bool },
    /// Task queued by `enqueue` at `vtime` with `slice`.
    Enqueue { t: u64, pid: Pid, vtime: u64, slice: u64 },
    /// `dispatch` refilled `cpu`'s local queue.
    Dispatch { t: u64, cpu: u32, pid: Pid },
    Run { t: u64, cpu: u32, pid: Pid, slice: u64 },
    Stop { t: u64, cpu: u32, pid: Pid, ran_ns: u64, runnable: bool },
    /// Controller write; `flag: None` is a removal.
    ControlSet { t: u64, pid: Pid, flag: Option<u32> },
    Idle { t: u64, cpu: u32 },
    Exit { t: u64, kind: ExitKind },
}

/// Fixed-capacity ring; the oldest events are evicted first.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TraceRing {
    cap: usize,
    buf: VecDeque<TraceEvent>,
}

impl TraceRing {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            buf: VecDeque::with_capacity(cap.min(4096)),
        }
    }

    #[inline(always)]
    pub fn cap(&self) -> usize {
        self.cap
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn push(&mut self, ev: TraceEvent) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(ev);
    }

    /// Events in chronological order.
    pub fn dump(&self) -> Vec<TraceEvent> {
        self.buf.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut ring = TraceRing::new(2);
        for cpu in 0..3 {
            ring.push(TraceEvent::Idle { t: 0, cpu });
        }
        assert_eq!(ring.len(), 2);
        assert_eq!(
            ring.dump(),
            vec![TraceEvent::Idle { t: 0, cpu: 1 }, TraceEvent::Idle { t: 0, cpu: 2 }]
        );
    }
}
