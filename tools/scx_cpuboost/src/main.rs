// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use scx_stats::prelude::*;

use scx_cpuboost::config::Frequency;
use scx_cpuboost::sources;
use scx_cpuboost::sources::display::{BACKLIGHT_CLASS, DRM_CLASS};
use scx_cpuboost::sources::SourceHandle;
use scx_cpuboost::sysfs::SYSFS_CPU_ROOT;
use scx_cpuboost::stats;
use scx_cpuboost::topology::nr_possible;
use scx_cpuboost::BoostConfig;
use scx_cpuboost::CpuBoost;
use scx_cpuboost::CpufreqPolicy;
use scx_cpuboost::SysfsCpufreq;
use scx_cpuboost::NAME;

const INPUT_DEV_DIR: &str = "/dev/input";

#[derive(Debug, Clone, clap::Parser)]
#[command(
    name = "scx_cpuboost",
    version,
    about = "Raise CPU frequency floors on task migration, touch input and core hotplug."
)]
struct Opts {
    /// TOML config file. Command line options override its values and the
    /// file is reloaded when it changes.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Enable input-driven boosting.
    #[clap(long)]
    enabled: Option<bool>,

    /// Migration boost duration in ms. 0 disables migration syncs.
    #[clap(short = 'b', long)]
    boost_ms: Option<u32>,

    /// Cap on the migration boost frequency in kHz. 0 = no cap.
    #[clap(long)]
    sync_threshold: Option<Frequency>,

    /// Input boost target in kHz. 0 disables input, hotplug and wake boosts.
    #[clap(short = 'f', long)]
    input_boost_freq: Option<Frequency>,

    /// Input boost duration in ms.
    #[clap(long)]
    input_boost_ms: Option<u32>,

    /// Minimum task load (percent) for a load-based migration sync.
    #[clap(long)]
    migration_load_threshold: Option<u32>,

    /// Scale migration boosts by task load instead of mirroring the source
    /// core's frequency.
    #[clap(long)]
    load_based_syncs: Option<bool>,

    /// Boost when a core comes online.
    #[clap(long)]
    hotplug_boost: Option<bool>,

    /// Boost when the display wakes up.
    #[clap(long)]
    wake_boost: Option<bool>,

    /// Minimum ms between two accepted input boosts.
    #[clap(long)]
    min_input_interval: Option<u32>,

    /// Run migration workers as SCHED_FIFO while they apply a boost.
    #[clap(long)]
    rt_workers: Option<bool>,

    /// Pin each migration worker to the core it serves.
    #[clap(long)]
    pin_workers: Option<bool>,

    /// Do not monitor touchscreens and touchpads.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_input: bool,

    /// Do not watch for cores coming online.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_hotplug: bool,

    /// Do not watch DRM connectors and backlights for display wake.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_display: bool,

    /// Feed migrations from the sched_migrate_task tracepoint. The
    /// tracepoint carries no load, so pair with --load-based-syncs false.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    trace_migrations: bool,

    /// tracefs mount point. Autodetected when unset.
    #[clap(long)]
    tracefs: Option<PathBuf>,

    /// sysfs CPU directory.
    #[clap(long, default_value = SYSFS_CPU_ROOT)]
    sysfs_root: PathBuf,

    /// Enable stats monitoring with the specified interval in seconds.
    #[clap(long, value_parser = stats::parse_interval)]
    stats: Option<Duration>,

    /// Run in stats monitoring mode with the specified interval. The boost
    /// engine is not started.
    #[clap(long, value_parser = stats::parse_interval)]
    monitor: Option<Duration>,

    /// Print monitored stats as JSON lines instead of the table.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    stats_json: bool,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,

    /// Enable verbose output. Repeat for trace output.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Opts {
    /// Overlay the options given on the command line onto `cfg`.
    fn apply(&self, mut cfg: BoostConfig) -> BoostConfig {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field {
                    cfg.$field = v;
                })*
            };
        }
        set!(
            enabled,
            boost_ms,
            sync_threshold,
            input_boost_freq,
            input_boost_ms,
            migration_load_threshold,
            load_based_syncs,
            hotplug_boost,
            wake_boost,
            min_input_interval,
            rt_workers,
            pin_workers
        );
        cfg
    }
}

fn init_log(verbose: u8) -> Result<()> {
    let loglevel = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    if lcfg.set_time_offset_to_local().is_err() {
        eprintln!("Failed to set local time offset, logging in UTC");
    }
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

fn start_sources(opts: &Opts, engine: &Arc<CpuBoost>) -> Vec<SourceHandle> {
    let mut handles = Vec::new();
    let mut add = |what: &str, res: Result<SourceHandle>| match res {
        Ok(h) => handles.push(h),
        Err(e) => warn!("{} disabled: {:#}", what, e),
    };

    if !opts.no_input {
        add(
            "input monitor",
            sources::input::spawn(Arc::clone(engine), PathBuf::from(INPUT_DEV_DIR)),
        );
    }
    if !opts.no_hotplug {
        add(
            "hotplug monitor",
            sources::hotplug::spawn(Arc::clone(engine), opts.sysfs_root.clone()),
        );
    }
    if !opts.no_display {
        add(
            "display wake monitor",
            sources::display::spawn(
                Arc::clone(engine),
                PathBuf::from(DRM_CLASS),
                PathBuf::from(BACKLIGHT_CLASS),
            ),
        );
    }
    if opts.trace_migrations {
        add(
            "migration tracing",
            sources::migration::spawn(Arc::clone(engine), opts.tracefs.clone()),
        );
    }
    if let Some(path) = &opts.config {
        let overlay_opts = opts.clone();
        add(
            "config reload",
            sources::config_watch::spawn(
                Arc::clone(engine),
                path.clone(),
                Box::new(move |cfg| overlay_opts.apply(cfg)),
            ),
        );
    }
    handles
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    init_log(opts.verbose)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let stats_thread = if let Some(intv) = opts.monitor.or(opts.stats) {
        let shutdown_copy = shutdown.clone();
        let json = opts.stats_json;
        Some(std::thread::spawn(move || {
            match stats::monitor(intv, shutdown_copy, json) {
                Ok(_) => {}
                Err(e) => {
                    warn!("stats monitor thread finished because of an error {}", e)
                }
            }
        }))
    } else {
        None
    };

    if opts.monitor.is_some() {
        if let Some(jh) = stats_thread {
            let _ = jh.join();
        }
        return Ok(());
    }

    let base = match &opts.config {
        Some(path) => BoostConfig::from_file(path)?,
        None => BoostConfig::default(),
    };
    let cfg = opts.apply(base);
    cfg.validate()?;
    info!("{}: {:?}", NAME, cfg);

    let stats_server = StatsServer::new(stats::server_data()).launch()?;
    let (stats_response_tx, stats_request_rx) = stats_server.channels();

    let sysfs = Arc::new(SysfsCpufreq::new(&opts.sysfs_root));
    let possible = sysfs
        .possible_cores()
        .context("Failed to enumerate possible CPUs")?;
    let policy: Arc<dyn CpufreqPolicy> = sysfs;
    let engine = CpuBoost::new(cfg, policy, nr_possible(&possible))?;
    engine.start();

    let mut handles = start_sources(&opts, &engine);

    while !shutdown.load(Ordering::Relaxed) {
        while stats_request_rx.try_recv().is_ok() {
            stats_response_tx.send(engine.metrics())?;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    for h in handles.iter_mut() {
        h.stop();
    }
    engine.stop();
    if let Some(jh) = stats_thread {
        let _ = jh.join();
    }
    Ok(())
}
