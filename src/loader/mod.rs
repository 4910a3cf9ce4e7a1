//! Loader: attaches the policy to the emulated host, drives the controller,
//! and handles the exit/restart handshake.
//!
//! Each interval the loader prints the policy counters as one
//! `local=<n> global=<n>` line and, with the control variant on, toggles every
//! watched PID between RUNNING and STOPPED. When the policy's recorded exit
//! carries [`SCX_ECODE_ACT_RESTART`](crate::policy::SCX_ECODE_ACT_RESTART) the
//! loader detaches and attaches a fresh policy instance. The control table is
//! owned by the loader and shared with every instance, so controller state
//! survives restarts.

pub mod state;

pub use state::{LoaderEvent, LoaderState};

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use log::{debug, error, info, warn};

use crate::ctrl_table::{ProcessControlTable, FLAG_RUNNING, FLAG_STOPPED};
use crate::host::{AttachError, AttachHandle, EmuConfig, EmuHost};
use crate::policy::{ConfigError, CtrlPolicy, ExitInfo, PolicyConfig};
use crate::task::Pid;
use crate::workload::Scenario;

/// How often the supervise loop checks for shutdown between ticks.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub policy: PolicyConfig,
    pub emu: EmuConfig,
    /// Stats and controller period.
    pub interval: Duration,
    /// PIDs the controller toggles each interval.
    pub watched: Vec<Pid>,
    pub scenario: Scenario,
}

impl LoaderConfig {
    /// Built-in workload on `emu.nr_cpus` CPUs, one-second interval.
    pub fn new(policy: PolicyConfig, emu: EmuConfig) -> Self {
        Self {
            policy,
            scenario: Scenario::builtin(emu.nr_cpus, &[]),
            emu,
            interval: Duration::from_secs(1),
            watched: Vec::new(),
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum LoaderError {
    Config(ConfigError),
    Attach(AttachError),
    Io(io::Error),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid configuration: {err}"),
            Self::Attach(err) => write!(f, "attach failed: {err}"),
            Self::Io(err) => write!(f, "failed to write stats: {err}"),
        }
    }
}

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Attach(err) => Some(err),
            Self::Io(err) => Some(err),
        }
    }
}

pub struct Loader {
    cfg: LoaderConfig,
    host: EmuHost,
    table: Arc<ProcessControlTable>,
    state: LoaderState,
    restarts: u32,
}

impl Loader {
    pub fn new(cfg: LoaderConfig) -> Result<Self, LoaderError> {
        cfg.policy.validate().map_err(LoaderError::Config)?;
        let table = Arc::new(ProcessControlTable::new(cfg.policy.max_control_entries));
        let host = EmuHost::new(cfg.emu);
        Ok(Self {
            cfg,
            host,
            table,
            state: LoaderState::Attaching,
            restarts: 0,
        })
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// Completed re-attaches.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn control_table(&self) -> &Arc<ProcessControlTable> {
        &self.table
    }

    /// Runs until `shutdown` is set or the policy exits without a restart
    /// request. Returns the last recorded exit.
    pub fn run(
        &mut self,
        shutdown: &AtomicBool,
        out: &mut dyn Write,
    ) -> Result<ExitInfo, LoaderError> {
        self.run_with(shutdown, out, |_, _| {})
    }

    /// Like [`run`](Self::run), calling `on_tick` after every interval with
    /// the live attachment and the tick number.
    pub fn run_with<F>(
        &mut self,
        shutdown: &AtomicBool,
        out: &mut dyn Write,
        mut on_tick: F,
    ) -> Result<ExitInfo, LoaderError>
    where
        F: FnMut(&AttachHandle, u64),
    {
        loop {
            let policy = Arc::new(
                CtrlPolicy::with_control_table(
                    self.cfg.policy.clone(),
                    self.cfg.emu.nr_cpus,
                    Arc::clone(&self.table),
                )
                .map_err(LoaderError::Config)?,
            );
            let handle = match self.host.attach(policy.clone(), &self.cfg.scenario) {
                Ok(handle) => handle,
                Err(err) => {
                    self.transition(LoaderEvent::AttachFailed);
                    return Err(LoaderError::Attach(err));
                }
            };
            self.transition(LoaderEvent::Attached);

            let supervised = self.supervise(&handle, &policy, shutdown, out, &mut on_tick);

            self.transition(LoaderEvent::Shutdown);
            let info = handle.detach();
            if info.kind.is_error() {
                error!("{info}");
            } else {
                info!("{info}");
            }
            supervised?;

            let restart = info.should_restart() && !shutdown.load(Ordering::Relaxed);
            self.transition(LoaderEvent::Detached { restart });
            if !restart {
                return Ok(info);
            }
            self.restarts += 1;
            info!("restarting policy (restart #{})", self.restarts);
            self.transition(LoaderEvent::Reattach);
        }
    }

    fn supervise(
        &self,
        handle: &AttachHandle,
        policy: &CtrlPolicy,
        shutdown: &AtomicBool,
        out: &mut dyn Write,
        on_tick: &mut dyn FnMut(&AttachHandle, u64),
    ) -> Result<(), LoaderError> {
        self.toggle_watched(0);
        let ticker = crossbeam_channel::tick(self.cfg.interval);
        let mut num: u64 = 0;

        while !shutdown.load(Ordering::Relaxed) && !handle.exited() {
            match ticker.recv_timeout(SHUTDOWN_POLL) {
                Ok(_) => {
                    writeln!(out, "{}", policy.stats().snapshot()).map_err(LoaderError::Io)?;
                    out.flush().map_err(LoaderError::Io)?;
                    num += 1;
                    self.toggle_watched(num);
                    on_tick(handle, num);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    /// Even ticks mark watched PIDs RUNNING, odd ticks STOPPED.
    fn toggle_watched(&self, num: u64) {
        if !self.cfg.policy.control {
            return;
        }
        let flag = if num % 2 == 0 { FLAG_RUNNING } else { FLAG_STOPPED };
        for &pid in &self.cfg.watched {
            match self.table.set(pid, flag) {
                Ok(()) => info!("pid {pid}: {:?}", self.table.get(pid)),
                Err(err) => warn!("pid {pid}: {err}"),
            }
        }
    }

    fn transition(&mut self, event: LoaderEvent) {
        match self.state.next(event) {
            Some(next) => {
                debug!("loader: {} -> {next}", self.state);
                self.state = next;
            }
            None => error!("loader: unexpected {event:?} while {}", self.state),
        }
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("state", &self.state)
            .field("restarts", &self.restarts)
            .field("host", &self.host)
            .finish()
    }
}
