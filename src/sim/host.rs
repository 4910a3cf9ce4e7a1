//! Deterministic host used by the simulation runner and unit tests.
//!
//! Holds the queue store and idle mask for one simulated machine. The runner
//! sets the "current CPU" before every callback; nothing here reads real time
//! or spawns threads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::dsq::DsqStore;
use crate::host::{CgroupInfo, Host, IdleMask};
use crate::task::{CpuId, Pid, Task};

pub struct SimHost {
    dsq: DsqStore,
    idle: IdleMask,
    current: AtomicU32,
    cgroups: BTreeMap<Pid, CgroupInfo>,
}

impl SimHost {
    /// A machine with `nr_cpus` busy CPUs and no queues.
    pub fn new(nr_cpus: usize) -> Self {
        Self::with_cgroups(nr_cpus, BTreeMap::new())
    }

    pub fn with_cgroups(nr_cpus: usize, cgroups: BTreeMap<Pid, CgroupInfo>) -> Self {
        let nr_cpus = nr_cpus.max(1);
        Self {
            dsq: DsqStore::new(nr_cpus),
            idle: IdleMask::new(nr_cpus),
            current: AtomicU32::new(0),
            cgroups,
        }
    }

    pub fn idle(&self) -> &IdleMask {
        &self.idle
    }

    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.current.store(cpu.as_u32(), Ordering::Relaxed);
    }
}

impl Host for SimHost {
    fn nr_cpus(&self) -> usize {
        self.dsq.nr_cpus()
    }

    fn dsq(&self) -> &DsqStore {
        &self.dsq
    }

    fn current_cpu(&self) -> CpuId {
        CpuId::from_u32(self.current.load(Ordering::Relaxed))
    }

    fn select_cpu_dfl(&self, _task: &Task, prev_cpu: CpuId, _wake_flags: u64) -> (CpuId, bool) {
        self.idle.select_dfl(prev_cpu)
    }

    fn task_cgroup(&self, task: &Task) -> Option<CgroupInfo> {
        self.cgroups.get(&task.pid()).cloned()
    }
}

impl std::fmt::Debug for SimHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHost")
            .field("dsq", &self.dsq)
            .field("idle", &self.idle)
            .field("current", &self.current_cpu())
            .finish()
    }
}
