// src/bin/clockspeeds.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clockspeeds::config::{default_cache_file, find_config_file, Config};
use clockspeeds::controller::{ControllerContext, CpuController};
use clockspeeds::dir_cache::DirectoryCache;
use clockspeeds::error::ControlError;
use clockspeeds::globals::{APP_NAME, PKEXEC_EXISTS, SYSTEMCTL_EXISTS};
use clockspeeds::locator::SysRoots;
use clockspeeds::modules::{SystemMonitor, ViewType};
use clockspeeds::privileged::{ExecOutcome, Pkexec, Ticket};
use clockspeeds::scheduler::RecurringTask;

/// Longest wait for one elevation prompt before giving up on the result.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "clockspeeds")]
#[command(about = "Monitor and control CPU frequency, governor, boost and power limits", long_about = None)]
struct Args {
    /// Live view of per-thread frequency and load
    #[arg(long)]
    monitor: bool,

    /// Print CPU model, caches, RAM and core counts
    #[arg(long)]
    info: bool,

    /// Set the scaling governor on every thread
    #[arg(long, value_name = "GOVERNOR")]
    governor: Option<String>,

    /// Minimum frequency in MHz
    #[arg(long, value_name = "MHZ")]
    min_freq: Option<i64>,

    /// Maximum frequency in MHz
    #[arg(long, value_name = "MHZ")]
    max_freq: Option<i64>,

    /// Threads the frequency limits apply to (default: all)
    #[arg(long, value_name = "N", value_delimiter = ',')]
    threads: Vec<usize>,

    /// Turn turbo boost on or off
    #[arg(long, value_name = "on|off", value_parser = parse_switch)]
    boost: Option<bool>,

    /// Package power limit in watts
    #[arg(long, value_name = "WATTS")]
    tdp: Option<f64>,

    /// Negative curve-optimizer offset magnitude (AMD with ryzen_smu)
    #[arg(long, value_name = "N")]
    pbo_offset: Option<i64>,

    /// Energy/performance bias: 0, 4, 6, 8 or 15
    #[arg(long, value_name = "VALUE")]
    epb: Option<u8>,

    /// Install a systemd service that re-applies this run's settings at boot
    #[arg(long)]
    apply_on_boot: bool,

    /// Remove the boot service
    #[arg(long, conflicts_with = "apply_on_boot")]
    remove_boot_service: bool,

    /// Discard the discovery cache and scan /sys again
    #[arg(long)]
    rescan: bool,

    /// Store a new monitor update interval in seconds (0.1 to 20)
    #[arg(long, value_name = "SECONDS")]
    interval: Option<f64>,

    /// Use config file at defined path
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Show debug info
    #[arg(long)]
    debug: bool,
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        other => Err(format!("expected on or off, got '{}'", other)),
    }
}

impl Args {
    fn wants_changes(&self) -> bool {
        self.governor.is_some()
            || self.min_freq.is_some()
            || self.max_freq.is_some()
            || self.boost.is_some()
            || self.tdp.is_some()
            || self.pbo_offset.is_some()
            || self.epb.is_some()
            || self.apply_on_boot
            || self.remove_boot_service
    }

    fn has_any_flag(&self) -> bool {
        self.monitor || self.info || self.rescan || self.interval.is_some() || self.wants_changes()
    }
}

fn init_logging(debug: bool, config: &Config) {
    let mut builder = if debug {
        let mut b = env_logger::Builder::new();
        b.filter_level(LevelFilter::Debug);
        b
    } else if std::env::var_os("RUST_LOG").is_some() {
        env_logger::Builder::from_env(env_logger::Env::default())
    } else {
        let mut b = env_logger::Builder::new();
        b.filter_level(config.logging_level());
        b
    };
    builder.init();
}

fn footer() {
    println!("\n{}\n", "-".repeat(79));
}

fn report(what: impl std::fmt::Display, outcome: &ExecOutcome) {
    match outcome {
        ExecOutcome::Success => println!("{}: applied", what),
        ExecOutcome::Cancelled => println!("{}: cancelled", what),
        ExecOutcome::Failed(reason) => println!("{}: failed ({})", what, reason),
    }
}

/// Wait for every submitted command, printing each outcome.
fn drain(controller: &mut CpuController, stop: &AtomicBool) {
    while controller.in_flight() > 0 && !stop.load(Ordering::Relaxed) {
        match controller.wait_for_completion(PROMPT_TIMEOUT) {
            Some(done) => report(&done.payload, &done.outcome),
            None => {
                warn!("Gave up waiting for {} privileged command(s)", controller.in_flight());
                break;
            }
        }
    }
}

fn submit(what: &str, result: Result<Ticket, ControlError>) {
    if let Err(e) = result {
        eprintln!("{}: {}", what, e);
    }
}

fn submit_changes(args: &Args, controller: &mut CpuController, config: &Config) {
    if args.min_freq.is_some() || args.max_freq.is_some() {
        // an omitted bound defaults to the hardware limit, kept inside the configured scale
        let scale = config.clock_scale();
        let (hw_min, hw_max) = controller
            .get_allowed_cpu_frequency()
            .overall()
            .unwrap_or((f64::from(scale.min), f64::from(scale.max)));
        let min = args
            .min_freq
            .unwrap_or(hw_min.max(f64::from(scale.min)).round() as i64);
        let max = args
            .max_freq
            .unwrap_or(hw_max.min(f64::from(scale.max)).round() as i64);
        let threads: Vec<usize> = if args.threads.is_empty() {
            (0..controller.table().thread_count).collect()
        } else {
            args.threads.clone()
        };
        submit("frequency limits", controller.apply_frequency_limits(threads, min, max));
    }
    if let Some(governor) = &args.governor {
        submit("governor", controller.apply_governor(governor));
    }
    if let Some(enabled) = args.boost {
        submit("boost", controller.apply_boost(enabled));
    }
    if let Some(watts) = args.tdp {
        submit("TDP", controller.apply_tdp(watts));
    }
    if let Some(offset) = args.pbo_offset {
        submit("PBO offset", controller.apply_pbo_offset(offset));
    }
    if let Some(value) = args.epb {
        submit("energy/performance bias", controller.apply_energy_perf_bias(value));
    }
}

fn run_monitor(
    controller: &mut CpuController,
    config: &Config,
    stop: &AtomicBool,
) -> Result<()> {
    if let Err(e) = config.watch() {
        warn!("Config changes will not be picked up live: {:#}", e);
    }

    let mut monitor = SystemMonitor::new(ViewType::Monitor);
    let cpu_report = controller.get_cpu_info();
    let config_path = config.has_config().then(|| config.get_path());

    let mut task = RecurringTask::new(config.update_interval());
    task.start(Instant::now());

    while !stop.load(Ordering::Relaxed) {
        if config.take_reloaded() {
            let interval = task.reschedule(config.update_interval(), Instant::now());
            info!("Config reloaded, update interval {:.1} s", interval);
        }

        for done in controller.process_completions() {
            report(&done.payload, &done.outcome);
        }

        if task.poll_due(Instant::now()) {
            let sample = controller.tick();
            let interval = task.interval().as_secs_f64();
            monitor.format_system_info(&cpu_report, &sample, config_path.as_deref(), interval);
            // clear screen
            println!("\x1B[2J\x1B[1;1H");
            println!("{}", monitor.render(80));
        }

        let wait = task
            .time_until_due(Instant::now())
            .unwrap_or(Duration::from_millis(100))
            .min(Duration::from_millis(100));
        thread::sleep(wait);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = find_config_file(args.config.as_deref())?;
    let config = Config::load(config_path)?;
    init_logging(args.debug, &config);

    if nix::unistd::Uid::effective().is_root() {
        eprintln!("\n{}\n", "-".repeat(33) + " Root check " + &"-".repeat(34));
        eprintln!("ERROR:\n");
        eprintln!("Do not run {} as root; changes are elevated one at a time through pkexec", APP_NAME);
        bail!("Running as root");
    }

    if !args.has_any_flag() {
        println!("\n{}\n", "-".repeat(33) + " ClockSpeeds " + &"-".repeat(33));
        println!("Monitor and control CPU frequency, governor, boost and power limits");
        println!("\nExample usage:\nclockspeeds --monitor\nclockspeeds --governor powersave --max-freq 2800");
        println!("\n-----\n");
        return Ok(());
    }

    if let Some(seconds) = args.interval {
        let kept = config.set_update_interval(seconds)?;
        println!("Update interval set to {:.1} s", kept);
    }

    let cache = default_cache_file()
        .map(DirectoryCache::with_file)
        .unwrap_or_default();
    if args.rescan {
        cache.remove_file()?;
        info!("Discovery cache removed");
    }

    let context = ControllerContext::discover(
        SysRoots::default(),
        cache,
        num_cpus::get(),
        &config,
        Arc::new(Pkexec),
    );
    let mut controller = CpuController::new(context)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if args.info {
        footer();
        for line in controller.get_cpu_info().lines() {
            println!("{}", line);
        }
        if let Some((min, max)) = controller.get_allowed_tdp_values() {
            println!("TDP range (W): {:.0} - {:.0}", min, max);
        }
        println!("Governors: {}", controller.available_governors().join(" "));
        footer();
    }

    if args.wants_changes() && !*PKEXEC_EXISTS {
        bail!("pkexec not found; it is needed to change CPU settings");
    }
    if (args.apply_on_boot || args.remove_boot_service) && !*SYSTEMCTL_EXISTS {
        bail!("systemctl not found; the boot service needs systemd");
    }

    submit_changes(&args, &mut controller, &config);
    drain(&mut controller, &stop);

    if args.apply_on_boot {
        match controller.apply_on_boot() {
            Ok(_) => drain(&mut controller, &stop),
            Err(e) => eprintln!("apply on boot: {:#}", e),
        }
    }
    if args.remove_boot_service {
        controller.remove_boot_service();
        drain(&mut controller, &stop);
    }

    if args.monitor {
        run_monitor(&mut controller, &config, &stop)?;
    }

    Ok(())
}
