//! Capture devices feeding raw frames into the monitor.
//!
//! A device is opened and configured by a [`CaptureOpener`], read one frame at
//! a time, and released exactly once through its owning [`CaptureHandle`].

#[cfg(feature = "opencv")]
mod camera;
mod ffmpeg;
mod types;

#[cfg(feature = "opencv")]
pub use camera::OpenCvCapture;
pub use ffmpeg::FfmpegCapture;
pub use types::{CaptureError, Frame, FrameFormat};

use std::sync::Arc;

use tracing::debug;

/// Ingress transport used to source frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local V4L device addressed by index or `/dev/videoN`.
    Device,
    Rtsp,
    Udp,
    /// HTTP(S) stream such as an IP camera MJPEG endpoint.
    Http,
    File,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("udp://") {
            SourceKind::Udp
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            SourceKind::Http
        } else if parse_device_index(uri).is_some() {
            SourceKind::Device
        } else {
            SourceKind::File
        }
    }
}

/// Where frames come from, as requested by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSource {
    pub uri: String,
    pub kind: SourceKind,
}

impl CaptureSource {
    /// Build a source from the `camera_url` / `camera_type` pair of a start request.
    ///
    /// `webcam` always means a local device; every other type is resolved from
    /// the URI scheme.
    pub fn from_request(camera_url: &str, camera_type: &str) -> Self {
        let uri = camera_url.trim().to_string();
        let kind = if camera_type.eq_ignore_ascii_case("webcam") {
            SourceKind::Device
        } else {
            SourceKind::from_uri(&uri)
        };
        Self { uri, kind }
    }

    /// V4L path for device sources.
    pub fn device_path(&self) -> String {
        match parse_device_index(&self.uri) {
            Some(index) => format!("/dev/video{index}"),
            None => self.uri.clone(),
        }
    }
}

/// Resolution and rate requested from the device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureSettings {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30.0,
        }
    }
}

/// A live frame source. Implementations block in `read` until a frame arrives.
pub trait CaptureDevice: Send {
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Close the underlying device. Called at most once by [`CaptureHandle`].
    fn release(&mut self);

    /// A way to abort a `read` blocked on another thread, if the backend has one.
    fn interrupter(&self) -> Option<Arc<dyn CaptureInterrupt>> {
        None
    }
}

/// Aborts a device from outside the thread that reads it.
///
/// After `interrupt` a pending or future `read` returns [`CaptureError::Closed`].
pub trait CaptureInterrupt: Send + Sync {
    fn interrupt(&self);
}

/// Opens and configures capture devices.
pub trait CaptureOpener: Send + Sync {
    fn open(
        &self,
        source: &CaptureSource,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

/// Backend used by [`SystemCaptureOpener`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureBackend {
    #[default]
    Ffmpeg,
    #[cfg(feature = "opencv")]
    OpenCv,
}

/// Opener backed by the host's ffmpeg binary or OpenCV.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemCaptureOpener {
    backend: CaptureBackend,
}

impl SystemCaptureOpener {
    pub fn new(backend: CaptureBackend) -> Self {
        Self { backend }
    }
}

impl CaptureOpener for SystemCaptureOpener {
    fn open(
        &self,
        source: &CaptureSource,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        match self.backend {
            CaptureBackend::Ffmpeg => Ok(Box::new(FfmpegCapture::open(source, settings)?)),
            #[cfg(feature = "opencv")]
            CaptureBackend::OpenCv => Ok(Box::new(OpenCvCapture::open(source, settings)?)),
        }
    }
}

/// Exclusive owner of an open device.
///
/// Release happens at most once, either explicitly or on drop.
pub struct CaptureHandle {
    device: Option<Box<dyn CaptureDevice>>,
    label: String,
}

impl CaptureHandle {
    pub fn new(device: Box<dyn CaptureDevice>, label: impl Into<String>) -> Self {
        Self {
            device: Some(device),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn read(&mut self) -> Result<Frame, CaptureError> {
        match self.device.as_mut() {
            Some(device) => device.read(),
            None => Err(CaptureError::Closed),
        }
    }

    /// Release the device. Returns `false` if it was already released.
    pub fn release(&mut self) -> bool {
        match self.device.take() {
            Some(mut device) => {
                device.release();
                debug!("released capture {}", self.label);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.device.is_none()
    }

    /// Interrupter for the owned device, taken before the handle moves to its reader.
    pub fn interrupter(&self) -> Option<Arc<dyn CaptureInterrupt>> {
        self.device.as_ref().and_then(|device| device.interrupter())
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<i32>().ok();
    }
    None
}
