use thiserror::Error;

/// Raw BGR frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Number of bytes a well-formed frame of this geometry carries.
    pub fn expected_len(&self) -> usize {
        let channels = match self.format {
            FrameFormat::Bgr8 => 3,
        };
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * channels
    }

    /// Reorder channels into packed RGB.
    pub fn to_rgb(&self) -> Vec<u8> {
        match self.format {
            FrameFormat::Bgr8 => {
                let mut output = Vec::with_capacity(self.data.len());
                for chunk in self.data.chunks_exact(3) {
                    output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
                }
                output
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to read frame: {0}")]
    Read(String),
    #[error("video source closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CaptureError {
    /// Whether the loop may keep reading after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Read(_))
    }
}
