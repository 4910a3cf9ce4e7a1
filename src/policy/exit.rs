//! Exit information recorded when a policy instance is torn down.
//!
//! The first exit wins: later reports (a host detaching after the policy
//! already failed, for instance) are ignored so the loader sees the root cause.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Exit-code bits: the reason field.
pub const SCX_ECODE_RSN_HOTPLUG: u64 = 1 << 32;
/// Exit-code bits: the loader should re-attach after this exit.
pub const SCX_ECODE_ACT_RESTART: u64 = 1 << 48;
const SCX_ECODE_ACT_MASK: u64 = 0xffff << 48;

/// Why a policy instance stopped, with the framework's numeric values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum ExitKind {
    None = 0,
    Done = 1,
    Unreg = 64,
    UnregBpf = 65,
    UnregKern = 66,
    SysRq = 67,
    Error = 1024,
    ErrorBpf = 1025,
    ErrorStall = 1026,
}

impl ExitKind {
    pub fn is_error(self) -> bool {
        self as i64 >= ExitKind::Error as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExitKind::None => "none",
            ExitKind::Done => "done",
            ExitKind::Unreg => "unregistered from user space",
            ExitKind::UnregBpf => "unregistered from the policy",
            ExitKind::UnregKern => "unregistered from the host",
            ExitKind::SysRq => "disabled by sysrq",
            ExitKind::Error => "runtime error",
            ExitKind::ErrorBpf => "policy error",
            ExitKind::ErrorStall => "runnable task stall",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub kind: ExitKind,
    pub exit_code: i64,
    pub reason: String,
    pub msg: String,
}

impl ExitInfo {
    pub fn new(kind: ExitKind) -> Self {
        Self {
            kind,
            exit_code: 0,
            reason: kind.as_str().to_string(),
            msg: String::new(),
        }
    }

    pub fn with_code(mut self, exit_code: i64) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    /// Whether the exit code asks the loader to attach a fresh instance.
    pub fn should_restart(&self) -> bool {
        (self.exit_code as u64) & SCX_ECODE_ACT_MASK == SCX_ECODE_ACT_RESTART
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EXIT: {}", self.reason)?;
        if !self.msg.is_empty() {
            write!(f, " ({})", self.msg)?;
        }
        if self.exit_code != 0 {
            write!(f, " code={:#x}", self.exit_code)?;
        }
        Ok(())
    }
}

/// Write-once exit slot shared between a policy and its host.
#[derive(Debug, Default)]
pub struct ExitRecord {
    info: OnceLock<ExitInfo>,
}

impl ExitRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `info` if nothing was recorded yet. Returns whether it was stored.
    pub fn record(&self, info: ExitInfo) -> bool {
        self.info.set(info).is_ok()
    }

    pub fn get(&self) -> Option<&ExitInfo> {
        self.info.get()
    }

    #[inline]
    pub fn has_exited(&self) -> bool {
        self.info.get().is_some()
    }
}
