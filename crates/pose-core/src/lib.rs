//! Pose-side building blocks for fall monitoring: the landmark model, the
//! per-frame confidence evaluator, the debouncing state machine, and the
//! provider seam for external pose estimation.

pub mod evaluator;
pub mod hysteresis;
pub mod landmarks;
pub mod provider;

pub use evaluator::{FallAssessment, FallCriterion, FallThresholds, TorsoGeometry, evaluate};
pub use hysteresis::{FallStateMachine, FallTransition};
pub use landmarks::{Landmark, LandmarkName, PoseLandmarks, SKELETON};
pub use provider::{PoseError, PoseProvider, RemotePoseProvider};
