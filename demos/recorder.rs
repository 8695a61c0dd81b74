//! Simulated recorder
//!
//! Runs the simulated amplifier through trigger detection, filtering and
//! re-referencing into storage, and mirrors the filtered stream to RDA
//! clients.
//!
//! Usage:
//!   cargo run --example recorder -- --seconds 30 --save --directory /tmp
//!   cargo run --example recorder -- --config pipeline.json

use biocorder::acquisition::{Amplifier, AmplifierSettings, SimulatedDevice};
use biocorder::nodes::{
    Filter, FilterConfig, Reference, ReferenceSettings, START_SAVING, STOP_SAVING, Storage,
    StorageSettings, TriggerDetector, TriggerSettings,
};
use biocorder::rda::{RdaServer, RdaServerSettings};
use biocorder::{EventKind, Pipeline, PipelineConfig};
use clap::Parser;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated biosignal recorder")]
struct Args {
    /// Pipeline configuration file; replaces the built-in chain
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output sample rate in Hz
    #[arg(short, long, default_value_t = 500.0)]
    rate: f64,

    /// Run time in seconds
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,

    /// Write the recording to disk
    #[arg(long)]
    save: bool,

    /// Directory for recordings
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// RDA listen address
    #[arg(long, default_value = "0.0.0.0:51244")]
    rda: String,

    /// Save the effective configuration to this file on exit
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

fn build(args: &Args) -> Result<Pipeline, Box<dyn std::error::Error>> {
    if let Some(path) = &args.config {
        info!("Loading pipeline from {}", path.display());
        return Ok(Pipeline::from_config(&PipelineConfig::load(path)?)?);
    }

    let mut pipeline = Pipeline::new();
    let settings = AmplifierSettings {
        sample_rate: args.rate,
        ..AmplifierSettings::default()
    };
    pipeline.add_stage("Amplifier", Amplifier::new(Box::new(SimulatedDevice::default()), settings)?)?;
    pipeline.add_stage("Trigger", TriggerDetector::new(TriggerSettings::default()))?;
    pipeline.add_stage(
        "Filter",
        Filter::new(FilterConfig {
            high_pass: 0.1,
            low_pass: 70.0,
            notch: true,
            ..FilterConfig::default()
        })?,
    )?;
    pipeline.add_stage("Reference", Reference::new(ReferenceSettings::default()))?;
    pipeline.add_stage(
        "Storage",
        Storage::new(StorageSettings {
            directory: args.directory.clone(),
        }),
    )?;
    pipeline.add_stage(
        "RDA",
        RdaServer::new(RdaServerSettings {
            address: args.rda.clone(),
        })?,
    )?;
    pipeline.chain(&["Amplifier", "Trigger", "Filter", "Reference", "Storage"])?;
    pipeline.connect("Filter", "RDA")?;
    Ok(pipeline)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("=== Recorder ===");
    info!("Stages: {}", build_summary(&args));

    let mut pipeline = build(&args)?;
    let events = pipeline.subscribe();
    pipeline.start()?;
    if args.save {
        pipeline.send_command(START_SAVING, "");
    }

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    while Instant::now() < deadline && pipeline.is_running() {
        for event in events.try_iter() {
            if let EventKind::Status(field) = &event.kind {
                info!("[{}] {}: {}", event.module, field, event.info);
            }
        }
        thread::sleep(Duration::from_millis(100));
    }

    if args.save {
        pipeline.send_command(STOP_SAVING, "");
        thread::sleep(Duration::from_millis(200));
    }
    if let Err(e) = pipeline.stop(false) {
        warn!("{}, forcing stop", e);
        pipeline.stop(true)?;
    }

    for (name, stats) in pipeline.stats() {
        info!(
            "{:<10} blocks={:<6} overruns={:<4} max={:?}",
            name, stats.blocks, stats.overruns, stats.max_time
        );
    }
    if let Some(path) = &args.dump_config {
        pipeline.snapshot_config().save(path)?;
        info!("Configuration written to {}", path.display());
    }
    pipeline.shutdown();
    Ok(())
}

fn build_summary(args: &Args) -> String {
    match &args.config {
        Some(path) => path.display().to_string(),
        None => format!("built-in chain at {} Hz", args.rate),
    }
}
