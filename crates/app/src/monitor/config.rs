//! Configuration for the monitoring service.
//!
//! This module owns translation of CLI arguments (with `FALLWATCH_*`
//! environment fallbacks) into a `MonitorConfig` which every stage reads
//! without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;
use pose_core::FallThresholds;
use video_ingest::CaptureSettings;

pub(crate) const DEFAULT_WEBHOOK_URL: &str = "http://localhost:8000/api/fall-detected";
pub(crate) const DEFAULT_POSE_URL: &str = "http://127.0.0.1:9000/pose";

#[derive(Clone, Debug)]
/// Canonical configuration shared by the session manager, pipeline and server.
pub struct MonitorConfig {
    /// Address the HTTP surface binds to.
    pub bind: String,
    pub port: u16,
    /// Resolution and rate requested from capture devices.
    pub capture: CaptureSettings,
    /// Endpoint of the external pose estimator.
    pub pose_url: String,
    pub pose_timeout: Duration,
    /// Per-frame fall criteria.
    pub thresholds: FallThresholds,
    /// Consecutive candidate frames required to confirm a fall.
    pub debounce_frames: u32,
    /// Minimum time between outbound notifications for one session.
    pub cooldown: Duration,
    /// JPEG quality of streamed frames.
    pub jpeg_quality: u8,
    pub notify: NotifyConfig,
    /// Upper bound on waiting for a pipeline to exit during stop.
    pub join_timeout: Duration,
    /// Pause after a transient capture read failure.
    pub read_retry: Duration,
    pub verbose: bool,
    pub telemetry: TelemetryOptions,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            capture: CaptureSettings::default(),
            pose_url: DEFAULT_POSE_URL.to_string(),
            pose_timeout: Duration::from_secs(2),
            thresholds: FallThresholds::default(),
            debounce_frames: 12,
            cooldown: Duration::from_secs(30),
            jpeg_quality: 85,
            notify: NotifyConfig::default(),
            join_timeout: Duration::from_secs(2),
            read_retry: Duration::from_millis(100),
            verbose: false,
            telemetry: TelemetryOptions::default(),
        }
    }
}

#[derive(Clone, Debug)]
/// Outbound webhook delivery policy.
pub struct NotifyConfig {
    pub webhook_url: String,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Total delivery attempts, including the first.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Snapshots wider than this are downscaled, preserving aspect ratio.
    pub snapshot_max_width: u32,
    pub snapshot_quality: u8,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: DEFAULT_WEBHOOK_URL.to_string(),
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            snapshot_max_width: 640,
            snapshot_quality: 60,
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "FALLWATCH_BIND", default_value = "0.0.0.0")]
    pub bind: String,
    /// Port for the HTTP server.
    #[arg(long, env = "FALLWATCH_PORT", default_value_t = 8080)]
    pub port: u16,
    /// Webhook notified when a fall is confirmed.
    #[arg(long, env = "FALLWATCH_WEBHOOK_URL", default_value = DEFAULT_WEBHOOK_URL)]
    pub webhook_url: String,
    /// Pose estimation endpoint receiving JPEG frames.
    #[arg(long, env = "FALLWATCH_POSE_URL", default_value = DEFAULT_POSE_URL)]
    pub pose_url: String,
    /// Pose request timeout in milliseconds.
    #[arg(long, env = "FALLWATCH_POSE_TIMEOUT_MS", default_value_t = 2_000)]
    pub pose_timeout_ms: u64,
    /// Capture width in pixels.
    #[arg(long, env = "FALLWATCH_WIDTH", default_value_t = 1280)]
    pub width: i32,
    /// Capture height in pixels.
    #[arg(long, env = "FALLWATCH_HEIGHT", default_value_t = 720)]
    pub height: i32,
    /// Capture frame rate.
    #[arg(long, env = "FALLWATCH_FPS", default_value_t = 30.0)]
    pub fps: f64,
    /// JPEG quality of the streamed frames (1-100).
    #[arg(long, env = "FALLWATCH_JPEG_QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Shoulder-to-hip vertical gap below which the torso counts as horizontal.
    #[arg(long, env = "FALLWATCH_VERTICAL_THRESHOLD", default_value_t = 0.18)]
    pub vertical_threshold: f32,
    /// Head height above the hips below which the head counts as low.
    #[arg(long, env = "FALLWATCH_NOSE_THRESHOLD", default_value_t = 0.12)]
    pub nose_threshold: f32,
    /// Shoulder-to-hip horizontal gap above which the torso counts as sideways.
    #[arg(long, env = "FALLWATCH_HORIZONTAL_THRESHOLD", default_value_t = 0.15)]
    pub horizontal_threshold: f32,
    /// Consecutive candidate frames required to confirm a fall.
    #[arg(long, env = "FALLWATCH_DEBOUNCE_FRAMES", default_value_t = 12)]
    pub debounce_frames: u32,
    /// Seconds between webhook notifications for the same session.
    #[arg(long, env = "FALLWATCH_COOLDOWN_SECS", default_value_t = 30)]
    pub cooldown_secs: u64,
    /// Per-attempt webhook timeout in seconds.
    #[arg(long, env = "FALLWATCH_WEBHOOK_TIMEOUT_SECS", default_value_t = 5)]
    pub webhook_timeout_secs: u64,
    /// Webhook delivery attempts.
    #[arg(long, env = "FALLWATCH_WEBHOOK_RETRIES", default_value_t = 2)]
    pub webhook_retries: u32,
    /// Delay between webhook attempts in milliseconds.
    #[arg(long, env = "FALLWATCH_WEBHOOK_RETRY_DELAY_MS", default_value_t = 1_000)]
    pub webhook_retry_delay_ms: u64,
    /// Maximum snapshot width sent with notifications.
    #[arg(long, env = "FALLWATCH_SNAPSHOT_MAX_WIDTH", default_value_t = 640)]
    pub snapshot_max_width: u32,
    /// JPEG quality of notification snapshots (1-100).
    #[arg(long, env = "FALLWATCH_SNAPSHOT_QUALITY", default_value_t = 60)]
    pub snapshot_quality: u8,
    /// How long stop waits for the pipeline to exit, in milliseconds.
    #[arg(long, env = "FALLWATCH_JOIN_TIMEOUT_MS", default_value_t = 2_000)]
    pub join_timeout_ms: u64,
    /// Pause after a failed frame read, in milliseconds.
    #[arg(long, env = "FALLWATCH_READ_RETRY_MS", default_value_t = 100)]
    pub read_retry_ms: u64,
    /// Write a Chrome trace of pipeline spans to this path.
    #[arg(long, env = "FALLWATCH_CHROME_TRACE", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Enable debug logging.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<ServeArgs> for MonitorConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        if args.width <= 0 || args.height <= 0 {
            bail!("--width and --height must be positive integers");
        }
        if !(args.fps.is_finite() && args.fps > 0.0) {
            bail!("--fps must be a positive number");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if !(1..=100).contains(&args.snapshot_quality) {
            bail!("--snapshot-quality must be an integer between 1 and 100");
        }
        for (flag, value) in [
            ("--vertical-threshold", args.vertical_threshold),
            ("--nose-threshold", args.nose_threshold),
            ("--horizontal-threshold", args.horizontal_threshold),
        ] {
            if !(value.is_finite() && value > 0.0) {
                bail!("{flag} must be a positive number");
            }
        }
        if args.debounce_frames == 0 {
            bail!("--debounce-frames must be at least 1");
        }
        if args.snapshot_max_width == 0 {
            bail!("--snapshot-max-width must be at least 1");
        }

        Ok(Self {
            bind: args.bind,
            port: args.port,
            capture: CaptureSettings {
                width: args.width,
                height: args.height,
                fps: args.fps,
            },
            pose_url: args.pose_url,
            pose_timeout: Duration::from_millis(args.pose_timeout_ms),
            thresholds: FallThresholds {
                vertical: args.vertical_threshold,
                nose: args.nose_threshold,
                horizontal: args.horizontal_threshold,
            },
            debounce_frames: args.debounce_frames,
            cooldown: Duration::from_secs(args.cooldown_secs),
            jpeg_quality: args.jpeg_quality,
            notify: NotifyConfig {
                webhook_url: args.webhook_url,
                timeout: Duration::from_secs(args.webhook_timeout_secs),
                max_retries: args.webhook_retries,
                retry_delay: Duration::from_millis(args.webhook_retry_delay_ms),
                snapshot_max_width: args.snapshot_max_width,
                snapshot_quality: args.snapshot_quality,
            },
            join_timeout: Duration::from_millis(args.join_timeout_ms),
            read_retry: Duration::from_millis(args.read_retry_ms),
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}
