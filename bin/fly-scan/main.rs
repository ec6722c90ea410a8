use chrono::Utc;
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use pvt_flyer::config::{load_config_or_default, AppConfig, AxisConfig};
use pvt_flyer::{
    export, plot_readback, AggregatedRecord, AxisBinding, AxisGroupRegistry, CancelToken,
    ControllerLink, Detector, FaultRecovery, FlyError, FlyScanCoordinator, FlyScanOptions,
    FtpStore, LogFileDetector, NullShutter, ProfileGenerator, ProfileTransport, RetryPolicy,
    RunRecorder, ScanDirection, XpsClient,
};
use std::{fs, path::PathBuf, sync::Arc, time::Duration};

/// PVT fly-scan runner
#[derive(Parser, Debug)]
#[command(name = "fly-scan")]
#[command(about = "Run jerk-limited PVT fly scans on a motion controller", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the number of legs
    #[arg(long)]
    legs: Option<usize>,

    /// Plot the fast-axis readback after the scan
    #[arg(long)]
    plot: bool,

    /// Generate and print the trajectory files without touching hardware
    #[arg(long)]
    dry_run: bool,

    /// Detector frame log, copied here by the acquisition system
    #[arg(long, value_name = "FILE")]
    detector_log: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_config_or_default(args.config.as_deref());
    if let Some(legs) = args.legs {
        config.scan.legs = legs;
    }

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level);
    log_startup_info(&config, args.config.as_ref());

    config.validate()?;

    if args.dry_run {
        return dry_run(&config);
    }

    let cancel = setup_shutdown_handler()?;
    let link = Arc::new(connect(&config)?);

    let mut registry = AxisGroupRegistry::discover(&link)?;
    let fast = bind(&mut registry, &config, &config.scan.fast_axis)?;
    let slow = match &config.scan.slow_axis {
        Some(name) => Some(bind(&mut registry, &config, name)?),
        None => None,
    };

    let detector: Option<Arc<dyn Detector>> = args
        .detector_log
        .as_ref()
        .map(|path| Arc::new(LogFileDetector::new("detector", path)) as Arc<dyn Detector>);

    let recovery = FaultRecovery::new(Arc::new(NullShutter), detector.clone());
    let transport = ProfileTransport::new(Box::new(FtpStore::new(config.ftp_settings())));
    let mut flyer = FlyScanCoordinator::new(Arc::clone(&link), transport, recovery)
        .with_options(FlyScanOptions {
            legs: config.scan.legs,
            ..FlyScanOptions::default()
        });
    if let Some(detector) = detector {
        flyer = flyer.with_detector(detector);
    }

    flyer.define(&fast, slow.as_ref(), &config.scan.trajectory_params())?;
    info!("Trajectory: {}", serde_json::to_string(&flyer.configuration()?)?);

    let result = run_scan(&mut flyer, &config, &cancel);
    if let Err(e) = flyer.unstage() {
        warn!("Unstage failed: {e}");
    }
    let record = result.inspect_err(|e| error!("Scan failed: {e}"))?;

    if config.recording.enabled {
        let path = create_record_path(&config.recording.output_path)?;
        let mut recorder = RunRecorder::new(path, 1, false);
        recorder.add(record.clone())?;
        recorder.finalize()?;
        info!("Run recorded to {}", recorder.path().display());
    }

    if args.plot {
        plot_readback(&record.fast, &record.fast_axis, &fast.unit, None)?;
    }

    Ok(())
}

/// Stage, run every leg serpentine-style, and collect.
fn run_scan(
    flyer: &mut FlyScanCoordinator,
    config: &AppConfig,
    cancel: &CancelToken,
) -> Result<AggregatedRecord, FlyError> {
    flyer.stage()?;

    let legs = config.scan.legs;
    for leg in 0..legs {
        if cancel.is_cancelled() {
            return Err(FlyError::Cancelled);
        }

        flyer.select_forward(leg % 2 == 0);
        info!("Leg {}/{legs}: {}", leg + 1, flyer.direction());
        let mut handle = flyer.kickoff()?;
        let readback = flyer.complete(&mut handle, cancel)?;
        info!("Leg {} returned {} samples", leg + 1, readback.len());

        if config.scan.slow_axis.is_some() && leg + 1 < legs {
            flyer.advance_slow_axis()?;
        }
    }

    flyer.collect()
}

fn connect(config: &AppConfig) -> Result<ControllerLink, FlyError> {
    let c = &config.controller;
    let client = XpsClient::builder()
        .address(&c.host)
        .port(c.port)
        .connect_timeout(c.connect_timeout())
        .read_timeout(c.read_timeout())
        .build()?;
    info!("Connected to controller at {}:{}", c.host, c.port);

    Ok(ControllerLink::new(
        client,
        RetryPolicy {
            retry_delay: c.retry_delay(),
            command_retries: c.command_retries,
        },
    ))
}

fn bind(
    registry: &mut AxisGroupRegistry,
    config: &AppConfig,
    name: &str,
) -> Result<AxisBinding, FlyError> {
    let axis = config
        .axis(name)
        .ok_or_else(|| FlyError::UnknownAxis(name.to_string()))?;
    let binding = registry.bind(
        &config.scan.group,
        &axis.positioner,
        &axis.name,
        &axis.unit,
        axis.direction,
        Duration::from_millis(axis.settle_time_ms),
    )?;
    info!(
        "{} bound to {} (index {} of {})",
        binding.logical_name, binding.positioner, binding.index, binding.group_size
    );
    Ok(binding)
}

/// Binding for a single-positioner group, used when no controller is
/// available to describe the real topology.
fn offline_binding(group: &str, axis: &AxisConfig) -> AxisBinding {
    let positioner = if axis.positioner.contains('.') {
        axis.positioner.clone()
    } else {
        format!("{group}.{}", axis.positioner)
    };
    AxisBinding {
        logical_name: axis.name.clone(),
        positioner,
        group: group.to_string(),
        index: 0,
        group_size: 1,
        direction: axis.direction,
        unit: axis.unit.clone(),
        settle_time: Duration::from_millis(axis.settle_time_ms),
    }
}

fn dry_run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let axis = config
        .axis(&config.scan.fast_axis)
        .ok_or_else(|| FlyError::UnknownAxis(config.scan.fast_axis.clone()))?;
    let fast = offline_binding(&config.scan.group, axis);
    let spec = ProfileGenerator::default().generate(
        &fast,
        None,
        &config.scan.trajectory_params(),
    )?;

    info!(
        "Ramp distance {:.6} {}, peak velocity {:.6} {}/s",
        spec.ramp_distance,
        fast.unit,
        spec.forward.peak_speed(),
        fast.unit
    );
    for direction in [ScanDirection::Forward, ScanDirection::Backward] {
        info!(
            "{direction} ready position {:.6}",
            spec.ready_position(direction)
        );
    }
    for file in export(&spec) {
        println!("# {}", file.name);
        print!("{}", file.contents);
    }
    Ok(())
}

/// Ctrl+C stops waiting for the current leg and aborts the scan
fn setup_shutdown_handler() -> Result<CancelToken, ctrlc::Error> {
    let cancel = CancelToken::new();
    let handler = cancel.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - aborting scan...");
        handler.cancel();
    })?;

    Ok(cancel)
}

fn log_startup_info(config: &AppConfig, config_path: Option<&PathBuf>) {
    info!("=== PVT fly scan ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!(
        "Controller: {}:{}",
        config.controller.host, config.controller.port
    );
    info!(
        "Scan: group {}, fast {}, slow {}, {} legs",
        config.scan.group,
        config.scan.fast_axis,
        config.scan.slow_axis.as_deref().unwrap_or("-"),
        config.scan.legs
    );
}

fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn create_record_path(output_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let dir = PathBuf::from(output_path);
    fs::create_dir_all(&dir)?;
    let filename = format!("fly_scan_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(dir.join(filename))
}
