//! ffmpeg subprocess capture emitting raw BGR24 frames over stdout.

use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    CaptureDevice, CaptureInterrupt, CaptureSettings, CaptureSource, SourceKind,
    types::{CaptureError, Frame, FrameFormat},
};

/// Device backed by an `ffmpeg` child process decoding to `rawvideo`.
pub struct FfmpegCapture {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    width: i32,
    height: i32,
    buffer: Vec<u8>,
}

impl FfmpegCapture {
    /// Spawn ffmpeg for `source`, scaled and rate-limited to `settings`.
    pub fn open(source: &CaptureSource, settings: &CaptureSettings) -> Result<Self, CaptureError> {
        if settings.width <= 0 || settings.height <= 0 {
            return Err(CaptureError::Other(anyhow!(
                "capture size must be positive, got {}x{}",
                settings.width,
                settings.height
            )));
        }

        let mut cmd = build_command(source, settings);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        debug!("spawning ffmpeg for {} ({:?})", source.uri, source.kind);

        let child = cmd.spawn().map_err(|err| {
            warn!("failed to spawn ffmpeg for {}: {err}", source.uri);
            CaptureError::Open {
                uri: source.uri.clone(),
            }
        })?;
        Self::from_child(child, settings.width, settings.height)
    }

    fn from_child(mut child: Child, width: i32, height: i32) -> Result<Self, CaptureError> {
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
            }
        };

        let frame_bytes = (width.max(0) as usize) * (height.max(0) as usize) * 3;
        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdout,
            width,
            height,
            buffer: vec![0u8; frame_bytes],
        })
    }
}

/// Kills the ffmpeg child so a blocked read sees EOF.
struct ChildKiller(Arc<Mutex<Child>>);

impl CaptureInterrupt for ChildKiller {
    fn interrupt(&self) {
        let mut child = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = child.kill() {
            debug!("ffmpeg already gone: {err}");
        }
    }
}

impl CaptureDevice for FfmpegCapture {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        match self.stdout.read_exact(&mut self.buffer) {
            Ok(()) => Ok(Frame {
                data: self.buffer.clone(),
                width: self.width,
                height: self.height,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            }),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::Closed),
            Err(err) => Err(CaptureError::Read(err.to_string())),
        }
    }

    fn release(&mut self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = child.kill();
        let _ = child.wait();
    }

    fn interrupter(&self) -> Option<Arc<dyn CaptureInterrupt>> {
        Some(Arc::new(ChildKiller(Arc::clone(&self.child))))
    }
}

fn build_command(source: &CaptureSource, settings: &CaptureSettings) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    match source.kind {
        SourceKind::Device => {
            cmd.arg("-f")
                .arg("video4linux2")
                .arg("-framerate")
                .arg(format_fps(settings.fps))
                .arg("-video_size")
                .arg(format!("{}x{}", settings.width, settings.height))
                .arg("-i")
                .arg(source.device_path());
        }
        SourceKind::Rtsp => {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-i")
                .arg(&source.uri);
        }
        SourceKind::Udp | SourceKind::Http => {
            cmd.arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-i")
                .arg(&source.uri);
        }
        SourceKind::File => {
            cmd.arg("-re").arg("-i").arg(&source.uri);
        }
    }

    cmd.arg("-an")
        .arg("-vf")
        .arg(format!(
            "scale={}:{},fps={}",
            settings.width,
            settings.height,
            format_fps(settings.fps)
        ))
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
    cmd
}

fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as i64)
    } else {
        format!("{fps:.3}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn device_sources_use_v4l_input() {
        let source = CaptureSource::from_request("1", "webcam");
        let cmd = build_command(&source, &CaptureSettings::default());
        let args = args(&cmd);
        assert!(args.windows(2).any(|w| w == ["-f", "video4linux2"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/dev/video1"]));
        assert!(args.windows(2).any(|w| w == ["-video_size", "1280x720"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn rtsp_sources_force_tcp() {
        let source = CaptureSource::from_request("rtsp://10.0.0.5/live", "ip");
        let args = args(&build_command(&source, &CaptureSettings::default()));
        assert!(args.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
        assert!(args.windows(2).any(|w| w == ["-vf", "scale=1280:720,fps=30"]));
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_unblocks_pending_read() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn sleep");
        let mut capture = FfmpegCapture::from_child(child, 4, 4).expect("wrap child");
        let interrupter = capture.interrupter().expect("ffmpeg capture is interruptible");

        let killer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            interrupter.interrupt();
        });
        let started = std::time::Instant::now();
        assert!(matches!(capture.read(), Err(CaptureError::Closed)));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        killer.join().expect("interrupt thread");
        capture.release();
    }

    #[test]
    fn fractional_rates_keep_precision() {
        assert_eq!(format_fps(30.0), "30");
        assert_eq!(format_fps(29.97), "29.970");
    }
}
