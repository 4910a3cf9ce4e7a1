//! Attach/restart state machine.
//!
//! ```text
//!   Attaching ──Attached──► Running ──Shutdown──► Detaching ──Detached{restart}──► RestartRequested
//!       │                                              │                                │
//!       └──AttachFailed──► Stopped ◄──Detached{!restart}┘            Attaching ◄──Reattach┘
//! ```
//!
//! Transitions are a pure function so the loader loop and its tests share
//! one definition.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoaderState {
    Attaching,
    Running,
    Detaching,
    RestartRequested,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderEvent {
    Attached,
    AttachFailed,
    /// Operator signal, or the policy recorded an exit.
    Shutdown,
    Detached { restart: bool },
    Reattach,
}

impl LoaderState {
    /// Next state, or `None` if `event` is not valid in this state.
    pub fn next(self, event: LoaderEvent) -> Option<Self> {
        use LoaderEvent as E;
        use LoaderState as S;
        match (self, event) {
            (S::Attaching, E::Attached) => Some(S::Running),
            (S::Attaching, E::AttachFailed) => Some(S::Stopped),
            (S::Running, E::Shutdown) => Some(S::Detaching),
            (S::Detaching, E::Detached { restart: true }) => Some(S::RestartRequested),
            (S::Detaching, E::Detached { restart: false }) => Some(S::Stopped),
            (S::RestartRequested, E::Reattach) => Some(S::Attaching),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }
}

impl fmt::Display for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Attaching => "attaching",
            Self::Running => "running",
            Self::Detaching => "detaching",
            Self::RestartRequested => "restart-requested",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
