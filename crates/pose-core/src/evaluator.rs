//! Per-frame fall scoring from torso geometry.
//!
//! Three independent criteria may each mark a frame as a fall candidate; the
//! frame confidence is the strongest triggered score, clamped to `[0, 100]`.

use crate::landmarks::{LandmarkName, PoseLandmarks};

const REQUIRED: [LandmarkName; 5] = [
    LandmarkName::Nose,
    LandmarkName::LeftShoulder,
    LandmarkName::RightShoulder,
    LandmarkName::LeftHip,
    LandmarkName::RightHip,
];

/// Tunable criterion thresholds, in normalized frame units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FallThresholds {
    /// Torso is considered horizontal when the shoulder-to-hip vertical gap is below this.
    pub vertical: f32,
    /// Head is considered low when its height above the hip line is below this.
    pub nose: f32,
    /// Torso is considered stretched sideways when the shoulder-to-hip horizontal gap exceeds this.
    pub horizontal: f32,
}

impl Default for FallThresholds {
    fn default() -> Self {
        Self {
            vertical: 0.18,
            nose: 0.12,
            horizontal: 0.15,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallCriterion {
    HorizontalTorso,
    LowHead,
    SidewaysTorso,
}

impl FallCriterion {
    pub fn label(self) -> &'static str {
        match self {
            FallCriterion::HorizontalTorso => "horizontal_torso",
            FallCriterion::LowHead => "low_head",
            FallCriterion::SidewaysTorso => "sideways_torso",
        }
    }
}

/// Torso measurements derived from the required landmarks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TorsoGeometry {
    pub vertical_diff: f32,
    pub horizontal_diff: f32,
    /// Height of the nose above the hip line; image y grows downwards.
    pub nose_height: f32,
}

impl TorsoGeometry {
    pub fn measure(landmarks: &PoseLandmarks) -> Option<Self> {
        let nose = landmarks.get(LandmarkName::Nose)?;
        let left_shoulder = landmarks.get(LandmarkName::LeftShoulder)?;
        let right_shoulder = landmarks.get(LandmarkName::RightShoulder)?;
        let left_hip = landmarks.get(LandmarkName::LeftHip)?;
        let right_hip = landmarks.get(LandmarkName::RightHip)?;

        let shoulder_x = (left_shoulder.x + right_shoulder.x) / 2.0;
        let shoulder_y = (left_shoulder.y + right_shoulder.y) / 2.0;
        let hip_x = (left_hip.x + right_hip.x) / 2.0;
        let hip_y = (left_hip.y + right_hip.y) / 2.0;

        Some(Self {
            vertical_diff: (shoulder_y - hip_y).abs(),
            horizontal_diff: (shoulder_x - hip_x).abs(),
            nose_height: hip_y - nose.y,
        })
    }
}

/// Outcome of scoring one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FallAssessment {
    pub is_candidate: bool,
    pub confidence: f32,
    /// Criterion that produced `confidence`, if any triggered.
    pub strongest: Option<FallCriterion>,
}

impl FallAssessment {
    pub const NONE: FallAssessment = FallAssessment {
        is_candidate: false,
        confidence: 0.0,
        strongest: None,
    };
}

/// Score a frame's landmarks. Missing required points yield [`FallAssessment::NONE`].
pub fn evaluate(landmarks: &PoseLandmarks, thresholds: &FallThresholds) -> FallAssessment {
    if REQUIRED.iter().any(|name| landmarks.get(*name).is_none()) {
        return FallAssessment::NONE;
    }
    let Some(geometry) = TorsoGeometry::measure(landmarks) else {
        return FallAssessment::NONE;
    };

    let mut best: Option<(FallCriterion, f32)> = None;
    let mut consider = |criterion: FallCriterion, score: f32| {
        let score = score.clamp(0.0, 100.0);
        if best.is_none_or(|(_, current)| score > current) {
            best = Some((criterion, score));
        }
    };

    if geometry.vertical_diff < thresholds.vertical {
        consider(
            FallCriterion::HorizontalTorso,
            (1.0 - geometry.vertical_diff / thresholds.vertical) * 100.0,
        );
    }
    if geometry.nose_height < thresholds.nose {
        consider(
            FallCriterion::LowHead,
            ((thresholds.nose - geometry.nose_height) * 300.0).max(85.0),
        );
    }
    if geometry.horizontal_diff > thresholds.horizontal {
        consider(
            FallCriterion::SidewaysTorso,
            (geometry.horizontal_diff * 500.0).min(100.0),
        );
    }

    match best {
        Some((criterion, confidence)) => FallAssessment {
            is_candidate: true,
            confidence,
            strongest: Some(criterion),
        },
        None => FallAssessment::NONE,
    }
}
