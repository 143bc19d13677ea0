use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Body keypoints the monitor understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkName {
    Nose,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl LandmarkName {
    pub const COUNT: usize = 13;

    pub const ALL: [LandmarkName; Self::COUNT] = [
        LandmarkName::Nose,
        LandmarkName::LeftShoulder,
        LandmarkName::RightShoulder,
        LandmarkName::LeftElbow,
        LandmarkName::RightElbow,
        LandmarkName::LeftWrist,
        LandmarkName::RightWrist,
        LandmarkName::LeftHip,
        LandmarkName::RightHip,
        LandmarkName::LeftKnee,
        LandmarkName::RightKnee,
        LandmarkName::LeftAnkle,
        LandmarkName::RightAnkle,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            LandmarkName::Nose => "nose",
            LandmarkName::LeftShoulder => "left_shoulder",
            LandmarkName::RightShoulder => "right_shoulder",
            LandmarkName::LeftElbow => "left_elbow",
            LandmarkName::RightElbow => "right_elbow",
            LandmarkName::LeftWrist => "left_wrist",
            LandmarkName::RightWrist => "right_wrist",
            LandmarkName::LeftHip => "left_hip",
            LandmarkName::RightHip => "right_hip",
            LandmarkName::LeftKnee => "left_knee",
            LandmarkName::RightKnee => "right_knee",
            LandmarkName::LeftAnkle => "left_ankle",
            LandmarkName::RightAnkle => "right_ankle",
        }
    }
}

impl fmt::Display for LandmarkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LandmarkName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LandmarkName::ALL
            .into_iter()
            .find(|name| name.label().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

/// Limb connections drawn by the overlay.
pub const SKELETON: [(LandmarkName, LandmarkName); 12] = [
    (LandmarkName::LeftShoulder, LandmarkName::RightShoulder),
    (LandmarkName::LeftShoulder, LandmarkName::LeftElbow),
    (LandmarkName::LeftElbow, LandmarkName::LeftWrist),
    (LandmarkName::RightShoulder, LandmarkName::RightElbow),
    (LandmarkName::RightElbow, LandmarkName::RightWrist),
    (LandmarkName::LeftShoulder, LandmarkName::LeftHip),
    (LandmarkName::RightShoulder, LandmarkName::RightHip),
    (LandmarkName::LeftHip, LandmarkName::RightHip),
    (LandmarkName::LeftHip, LandmarkName::LeftKnee),
    (LandmarkName::LeftKnee, LandmarkName::LeftAnkle),
    (LandmarkName::RightHip, LandmarkName::RightKnee),
    (LandmarkName::RightKnee, LandmarkName::RightAnkle),
];

/// Normalized 2-D keypoint; `x` and `y` are fractions of frame width and height.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default = "full_visibility")]
    pub visibility: f32,
}

fn full_visibility() -> f32 {
    1.0
}

impl Landmark {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            visibility: 1.0,
        }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Landmarks detected on a single frame. Any point may be absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoseLandmarks {
    points: [Option<Landmark>; LandmarkName::COUNT],
}

impl PoseLandmarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: LandmarkName, landmark: Landmark) -> Self {
        self.insert(name, landmark);
        self
    }

    /// Store a landmark. Non-finite coordinates are dropped.
    pub fn insert(&mut self, name: LandmarkName, landmark: Landmark) {
        self.points[name.index()] = landmark.is_finite().then_some(landmark);
    }

    pub fn remove(&mut self, name: LandmarkName) -> Option<Landmark> {
        self.points[name.index()].take()
    }

    pub fn get(&self, name: LandmarkName) -> Option<Landmark> {
        self.points[name.index()]
    }

    pub fn len(&self) -> usize {
        self.points.iter().filter(|point| point.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (LandmarkName, Landmark)> + '_ {
        LandmarkName::ALL
            .into_iter()
            .filter_map(|name| self.get(name).map(|point| (name, point)))
    }
}

impl FromIterator<(LandmarkName, Landmark)> for PoseLandmarks {
    fn from_iter<T: IntoIterator<Item = (LandmarkName, Landmark)>>(iter: T) -> Self {
        let mut landmarks = PoseLandmarks::new();
        for (name, point) in iter {
            landmarks.insert(name, point);
        }
        landmarks
    }
}
