//! OpenCV-backed camera capture.

use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use chrono::Utc;

use crate::{
    CaptureDevice, CaptureSettings, CaptureSource, SourceKind, parse_device_index,
    types::{CaptureError, Frame, FrameFormat},
};

pub struct OpenCvCapture {
    cap: VideoCapture,
    frame: Mat,
    scratch: Mat,
    target_size: (i32, i32),
}

impl OpenCvCapture {
    pub fn open(source: &CaptureSource, settings: &CaptureSettings) -> Result<Self, CaptureError> {
        let mut cap = open_video_capture(source)?;
        configure_camera(&mut cap, (settings.width, settings.height), settings.fps);
        Ok(Self {
            cap,
            frame: Mat::default(),
            scratch: Mat::default(),
            target_size: (settings.width, settings.height),
        })
    }
}

impl CaptureDevice for OpenCvCapture {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        if !grabbed || size.width <= 0 {
            return Err(CaptureError::Read("empty frame".into()));
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Read(e.to_string()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Read(e.to_string()))?
            .to_vec();

        Ok(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn release(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!("failed to release OpenCV capture: {err}");
        }
    }
}

fn open_video_capture(source: &CaptureSource) -> Result<VideoCapture, CaptureError> {
    if source.kind == SourceKind::Device {
        if let Some(index) = parse_device_index(&source.uri) {
            for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
                match VideoCapture::new(index, backend) {
                    Ok(cap) if cap.is_opened().unwrap_or(false) => return Ok(cap),
                    Ok(_) => {}
                    Err(err) => {
                        warn!("failed to open device #{index} with backend {backend}: {err}");
                    }
                }
            }
        }
    }

    match VideoCapture::from_file(&source.uri, videoio::CAP_ANY) {
        Ok(cap) if cap.is_opened().unwrap_or(false) => Ok(cap),
        Ok(_) => Err(CaptureError::Open {
            uri: source.uri.clone(),
        }),
        Err(err) => {
            warn!("failed to open {}: {err}", source.uri);
            Err(CaptureError::Open {
                uri: source.uri.clone(),
            })
        }
    }
}

fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
