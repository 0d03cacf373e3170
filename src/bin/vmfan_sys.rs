use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use vmfan::common::config::{FanEntry, ServerFileConfig};
use vmfan::common::logging;
use vmfan::service::Daemon;
use vmfan::service::daemon::warn_if_unprivileged;

/// Host side: drive GPU fans from temperatures reported by the guest.
#[derive(Parser, Debug)]
#[command(name = "vmfan-sys", version, about)]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Fan speed in percent when telemetry goes stale
    #[arg(long)]
    failsafe_speed: Option<i64>,

    /// Fan speed in percent until the first temperature arrives
    #[arg(long)]
    initial_speed: Option<i64>,

    /// Seconds without telemetry before falling back to the failsafe speed
    #[arg(long)]
    staleness_timeout: Option<f64>,

    /// Controlled fan; repeat for more. Replaces the fans from the config file
    #[arg(long, num_args = 3, value_names = ["GPU", "PWM", "MODE"])]
    fan_config: Vec<String>,

    /// Single-fan PWM file
    #[arg(long)]
    pwm_path: Option<PathBuf>,

    /// Single-fan mode file
    #[arg(long)]
    mode_path: Option<PathBuf>,

    #[arg(short, long)]
    debug: bool,
}

fn apply_overrides(file: &mut ServerFileConfig, args: Args) {
    if let Some(host) = args.host {
        file.host = host;
    }
    if let Some(port) = args.port {
        file.port = port;
    }
    if let Some(percent) = args.failsafe_speed {
        file.failsafe_fan_percent = percent;
    }
    if let Some(percent) = args.initial_speed {
        file.initial_fan_percent = percent;
    }
    if args.staleness_timeout.is_some() {
        file.staleness_timeout = args.staleness_timeout;
    }

    if !args.fan_config.is_empty() {
        file.pwm_path = None;
        file.mode_path = None;
        file.fans = args
            .fan_config
            .chunks(3)
            .map(|fan| {
                (
                    fan[0].clone(),
                    FanEntry {
                        pwm_path: PathBuf::from(&fan[1]),
                        mode_path: PathBuf::from(&fan[2]),
                        ..FanEntry::default()
                    },
                )
            })
            .collect();
    }
    if args.pwm_path.is_some() {
        file.pwm_path = args.pwm_path;
    }
    if args.mode_path.is_some() {
        file.mode_path = args.mode_path;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.debug).context("Failed to initialize logging")?;

    info!("Starting vmfan system daemon");
    warn_if_unprivileged();

    let mut file = ServerFileConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    apply_overrides(&mut file, args);
    let settings = file.validate().context("Invalid configuration")?;

    let daemon = Daemon::start(&settings)
        .await
        .context("Failed to start fan control")?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    daemon
        .run_until(async {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            }
        })
        .await;

    info!("Shutdown complete");

    Ok(())
}
