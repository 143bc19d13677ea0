use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use video_ingest::{
    CaptureHandle, CaptureOpener, CaptureSettings, CaptureSource, SystemCaptureOpener,
};

use crate::monitor::{self, MonitorConfig, ServeArgs, TelemetryOptions, telemetry};

#[derive(Debug, Parser)]
#[command(name = "fallwatch", version, about = "Camera fall monitoring service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP service.
    Serve(ServeArgs),
    /// Open a camera, read one frame and report its geometry.
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Device index, device path or stream URL.
    pub camera_url: String,
    /// `webcam` for local devices; anything else is treated as a stream URL.
    #[arg(long, default_value = "webcam")]
    pub camera_type: String,
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve(args) => {
            let config = MonitorConfig::try_from(args)?;
            let _telemetry = telemetry::init_tracing(&config.telemetry, config.verbose);
            monitor::run(config)
        }
        Command::Probe(args) => {
            let _telemetry = telemetry::init_tracing(&TelemetryOptions::default(), false);
            probe(&args)
        }
    }
}

fn probe(args: &ProbeArgs) -> Result<()> {
    let source = CaptureSource::from_request(&args.camera_url, &args.camera_type);
    let device = SystemCaptureOpener::default()
        .open(&source, &CaptureSettings::default())
        .with_context(|| format!("cannot open camera {}", source.uri))?;
    let mut handle = CaptureHandle::new(device, source.uri.clone());
    let frame = handle
        .read()
        .with_context(|| format!("cannot read from camera {}", source.uri))?;
    info!(kind = ?source.kind, "camera opened");
    println!("{}: {}x{}", source.uri, frame.width, frame.height);
    handle.release();
    Ok(())
}
