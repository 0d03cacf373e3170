use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use vmfan::client::TemperatureMonitor;
use vmfan::common::config::{ClientFileConfig, SensorSource};
use vmfan::common::logging;

/// Guest side: report GPU temperatures to the host fan daemon.
#[derive(Parser, Debug)]
#[command(name = "vmfan", version, about)]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address of the host running vmfan-sys
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds between samples
    #[arg(short, long)]
    interval: Option<f64>,

    /// hwmon temp*_input file; repeat for more GPUs (gpu0, gpu1, ...)
    #[arg(long = "gpu-path")]
    gpu_paths: Vec<PathBuf>,

    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.debug).context("Failed to initialize logging")?;

    info!("Starting vmfan telemetry client");

    let mut file = ClientFileConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(host) = args.host {
        file.host = host;
    }
    if let Some(port) = args.port {
        file.port = port;
    }
    if let Some(interval) = args.interval {
        file.sleep_interval = interval;
    }
    if !args.gpu_paths.is_empty() {
        file.gpus = args
            .gpu_paths
            .into_iter()
            .enumerate()
            .map(|(i, temp_path)| (format!("gpu{}", i), SensorSource::Hwmon { temp_path }))
            .collect();
    }
    let settings = file.validate().context("Invalid configuration")?;

    let mut monitor =
        TemperatureMonitor::new(&settings).context("Failed to open temperature sensors")?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = monitor.run() => {},
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
    }

    info!(
        "Stopped after {} reconnect(s)",
        monitor.link().reconnects()
    );

    Ok(())
}
