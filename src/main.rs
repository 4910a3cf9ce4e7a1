//! `scx-ctrl`: attaches the controllable vtime policy to an emulated machine.
//!
//! Prints `local=<n> global=<n>` to stdout every interval until SIGINT or
//! SIGTERM, then detaches. A policy exit that requests a restart re-attaches
//! without operator action.
//!
//! # Exit Codes
//!
//! - `0`: clean detach
//! - `1`: initialization failure or the policy exited with an error
//! - `2`: invalid arguments

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use scx_ctrl::host::EmuConfig;
use scx_ctrl::loader::{Loader, LoaderConfig};
use scx_ctrl::policy::{PolicyConfig, SchedMode};
use scx_ctrl::task::Pid;
use scx_ctrl::workload::Scenario;

const SCHEDULER_NAME: &str = "scx_ctrl";

/// A simple scheduling policy with an external throttling controller.
#[derive(Debug, Parser)]
#[command(name = "scx-ctrl", version)]
struct Opts {
    /// Use FIFO scheduling instead of weighted vtime scheduling.
    #[arg(short = 'f', long)]
    fifo: bool,

    /// Print debug messages.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Consult the process control table and throttle stopped PIDs.
    #[arg(short = 'c', long)]
    control: bool,

    /// PID to register in the control table and toggle between RUNNING and
    /// STOPPED every interval. Implies --control. May be repeated.
    #[arg(short = 'p', long = "pid")]
    pids: Vec<Pid>,

    /// Stats and controller interval in seconds.
    #[arg(short = 'i', long, default_value = "1")]
    interval: f64,

    /// Number of emulated CPUs. Defaults to the available parallelism.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    cpus: Option<u32>,

    /// JSON workload for the emulated host instead of the built-in mix.
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Capacity of the process control table.
    #[arg(long, default_value = "100")]
    max_entries: usize,
}

fn init_logging(verbose: bool) -> Result<()> {
    let loglevel = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn parse_interval(secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(interval) if !interval.is_zero() => Ok(interval),
        Ok(_) => bail!("--interval must be a positive number of seconds"),
        Err(err) => bail!("--interval {secs}: {err}"),
    }
}

fn loader_config(opts: &Opts) -> Result<LoaderConfig> {
    let interval = parse_interval(opts.interval)?;

    let policy = PolicyConfig {
        mode: if opts.fifo {
            SchedMode::Fifo
        } else {
            SchedMode::Vtime
        },
        control: opts.control || !opts.pids.is_empty(),
        max_control_entries: opts.max_entries,
        ..PolicyConfig::default()
    };

    let mut emu = EmuConfig::default();
    let scenario = match &opts.scenario {
        Some(path) => Scenario::load(path)
            .with_context(|| format!("failed to load scenario {}", path.display()))?,
        None => Scenario::builtin(opts.cpus.map_or(emu.nr_cpus, |n| n as usize), &opts.pids),
    };
    emu.nr_cpus = opts.cpus.map_or(scenario.nr_cpus, |n| n as usize);

    let mut cfg = LoaderConfig::new(policy, emu);
    cfg.interval = interval;
    cfg.watched = opts.pids.clone();
    cfg.scenario = scenario;
    Ok(cfg)
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose)?;

    let cfg = loader_config(&opts)?;
    info!(
        "{} {} ({:?} mode, control {}, {} cpus)",
        SCHEDULER_NAME,
        env!("CARGO_PKG_VERSION"),
        cfg.policy.mode,
        if cfg.policy.control { "on" } else { "off" },
        cfg.emu.nr_cpus
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut loader = Loader::new(cfg).context("failed to initialize loader")?;
    let stdout = io::stdout();
    let info = loader
        .run(&shutdown, &mut stdout.lock())
        .context("scheduler failed")?;

    if info.kind.is_error() {
        bail!("{SCHEDULER_NAME} exited with error: {info}");
    }
    info!("unregistered {SCHEDULER_NAME}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_accepts_fractional_seconds() {
        assert_eq!(parse_interval(0.5).unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval(2.0).unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn interval_rejects_unrepresentable_values() {
        for secs in [0.0, -1.0, 1e300, f64::INFINITY, f64::NAN] {
            assert!(parse_interval(secs).is_err(), "{secs} accepted");
        }
    }
}
