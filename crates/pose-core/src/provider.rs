//! Seam to the external pose estimator.

use std::time::Duration;

use image::{RgbImage, codecs::jpeg::JpegEncoder};
use reqwest::{
    StatusCode,
    blocking::Client,
    header::{CONTENT_TYPE, HeaderValue},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use video_ingest::Frame;

use crate::landmarks::{Landmark, LandmarkName, PoseLandmarks};

#[derive(Debug, Error)]
pub enum PoseError {
    #[error("frame buffer does not match its {width}x{height} geometry")]
    InvalidFrame { width: i32, height: i32 },
    #[error("failed to encode frame for pose request: {0}")]
    Encode(String),
    #[error("pose request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("pose service returned status {0}")]
    Status(StatusCode),
}

/// Returns the landmarks visible in a frame, or `None` when no person is found.
pub trait PoseProvider: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Option<PoseLandmarks>, PoseError>;
}

#[derive(Deserialize)]
struct PoseResponse {
    #[serde(default)]
    landmarks: Option<Vec<NamedLandmark>>,
}

#[derive(Deserialize)]
struct NamedLandmark {
    name: String,
    #[serde(flatten)]
    point: Landmark,
}

/// Pose estimation served over HTTP.
///
/// Each frame is posted as `image/jpeg`; the service answers with
/// `{"landmarks": [{"name": "nose", "x": 0.5, "y": 0.2, "visibility": 0.9}, ...]}`
/// or `{"landmarks": null}` when nobody is in view.
pub struct RemotePoseProvider {
    client: Client,
    endpoint: String,
    jpeg_quality: u8,
    min_visibility: f32,
}

impl RemotePoseProvider {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, PoseError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            jpeg_quality: 80,
            min_visibility: 0.5,
        })
    }

    /// Drop landmarks whose reported visibility is below `min_visibility`.
    pub fn with_min_visibility(mut self, min_visibility: f32) -> Self {
        self.min_visibility = min_visibility;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, PoseError> {
        if frame.data.len() != frame.expected_len() {
            return Err(PoseError::InvalidFrame {
                width: frame.width,
                height: frame.height,
            });
        }
        let image = RgbImage::from_raw(frame.width as u32, frame.height as u32, frame.to_rgb())
            .ok_or(PoseError::InvalidFrame {
                width: frame.width,
                height: frame.height,
            })?;
        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality)
            .encode_image(&image)
            .map_err(|err| PoseError::Encode(err.to_string()))?;
        Ok(buffer)
    }
}

impl PoseProvider for RemotePoseProvider {
    fn detect(&self, frame: &Frame) -> Result<Option<PoseLandmarks>, PoseError> {
        let body = self.encode(frame)?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, HeaderValue::from_static("image/jpeg"))
            .body(body)
            .send()?;
        if !response.status().is_success() {
            return Err(PoseError::Status(response.status()));
        }
        let parsed: PoseResponse = response.json()?;
        Ok(into_landmarks(parsed, self.min_visibility))
    }
}

fn into_landmarks(response: PoseResponse, min_visibility: f32) -> Option<PoseLandmarks> {
    let landmarks: PoseLandmarks = response
        .landmarks?
        .into_iter()
        .filter(|named| named.point.visibility >= min_visibility)
        .filter_map(|named| match named.name.parse::<LandmarkName>() {
            Ok(name) => Some((name, named.point)),
            Err(()) => {
                debug!("ignoring unknown landmark {:?}", named.name);
                None
            }
        })
        .collect();
    (!landmarks.is_empty()).then_some(landmarks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_ingest::FrameFormat;

    fn parse(json: &str) -> Option<PoseLandmarks> {
        let response: PoseResponse = serde_json::from_str(json).expect("valid json");
        into_landmarks(response, 0.5)
    }

    #[test]
    fn null_or_empty_landmarks_mean_no_person() {
        assert!(parse(r#"{"landmarks": null}"#).is_none());
        assert!(parse(r#"{}"#).is_none());
        assert!(parse(r#"{"landmarks": []}"#).is_none());
    }

    #[test]
    fn keeps_known_visible_points() {
        let landmarks = parse(
            r#"{"landmarks": [
                {"name": "nose", "x": 0.5, "y": 0.2, "visibility": 0.9},
                {"name": "left_hip", "x": 0.4, "y": 0.6},
                {"name": "right_hip", "x": 0.6, "y": 0.6, "visibility": 0.1},
                {"name": "left_ear", "x": 0.45, "y": 0.18}
            ]}"#,
        )
        .expect("landmarks present");
        assert_eq!(landmarks.len(), 2);
        assert_eq!(
            landmarks.get(LandmarkName::Nose).map(|p| (p.x, p.y)),
            Some((0.5, 0.2))
        );
        assert!(landmarks.get(LandmarkName::LeftHip).is_some());
        assert!(landmarks.get(LandmarkName::RightHip).is_none());
    }

    #[test]
    fn rejects_truncated_frames_before_sending() {
        let provider = RemotePoseProvider::new("http://127.0.0.1:9/pose", Duration::from_millis(50))
            .expect("client");
        let frame = Frame {
            data: vec![0; 10],
            width: 4,
            height: 4,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        assert!(matches!(
            provider.detect(&frame),
            Err(PoseError::InvalidFrame { .. })
        ));
    }
}
