//! Policy configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ctrl_table::DEFAULT_MAX_ENTRIES;

/// Default time slice: 20 ms.
pub const SCX_SLICE_DFL: u64 = 20_000_000;

/// Slice granted to a throttled task: 1 ms.
pub const THROTTLED_SLICE: u64 = 1_000_000;

/// How tasks in the shared queue are ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedMode {
    /// Weighted virtual time.
    #[default]
    Vtime,
    /// Arrival order.
    Fifo,
}

/// Tunables of [`CtrlPolicy`](super::CtrlPolicy).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: SchedMode,

    /// Consult the control table and throttle stopped processes.
    pub control: bool,

    /// Slice for normal insertions, and the budget a sleeper may lag behind
    /// the clock.
    pub slice_dfl_ns: u64,

    /// Slice for stopped processes in the control variant.
    pub throttled_slice_ns: u64,

    /// Every this many dispatch rounds on a CPU, the throttle queue is served
    /// before the shared queue.
    pub throttle_drain_period: u32,

    /// Maximum stopped heads diverted in one dispatch before giving up on the
    /// shared queue for that round.
    pub dispatch_batch: u32,

    /// Capacity of the control table.
    pub max_control_entries: usize,
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slice_dfl_ns == 0 {
            return Err(ConfigError::ZeroSlice);
        }
        if self.throttled_slice_ns == 0 || self.throttled_slice_ns > self.slice_dfl_ns {
            return Err(ConfigError::ThrottledSlice {
                throttled_ns: self.throttled_slice_ns,
                slice_dfl_ns: self.slice_dfl_ns,
            });
        }
        if self.throttle_drain_period == 0 {
            return Err(ConfigError::ZeroDrainPeriod);
        }
        if self.dispatch_batch == 0 {
            return Err(ConfigError::ZeroDispatchBatch);
        }
        if self.max_control_entries == 0 {
            return Err(ConfigError::ZeroControlEntries);
        }
        Ok(())
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: SchedMode::Vtime,
            control: false,
            slice_dfl_ns: SCX_SLICE_DFL,
            throttled_slice_ns: THROTTLED_SLICE,
            throttle_drain_period: 8,
            dispatch_batch: 4,
            max_control_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    ZeroSlice,
    ThrottledSlice { throttled_ns: u64, slice_dfl_ns: u64 },
    ZeroDrainPeriod,
    ZeroDispatchBatch,
    ZeroControlEntries,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSlice => write!(f, "slice_dfl_ns must be > 0"),
            Self::ThrottledSlice {
                throttled_ns,
                slice_dfl_ns,
            } => write!(
                f,
                "throttled_slice_ns must be in 1..={slice_dfl_ns} (got {throttled_ns})"
            ),
            Self::ZeroDrainPeriod => write!(f, "throttle_drain_period must be > 0"),
            Self::ZeroDispatchBatch => write!(f, "dispatch_batch must be > 0"),
            Self::ZeroControlEntries => write!(f, "max_control_entries must be > 0"),
        }
    }
}

impl std::error::Error for ConfigError {}
