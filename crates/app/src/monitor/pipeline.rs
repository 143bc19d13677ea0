//! Per-session frame loop.
//!
//! One thread per session reads frames, asks the pose provider for landmarks,
//! folds the evaluation into the fall state machine and publishes an annotated
//! JPEG. The loop polls the session's `running` flag every iteration.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use chrono::Utc;
use crossbeam_channel::Sender;
use pose_core::{
    FallAssessment, FallStateMachine, FallThresholds, FallTransition, PoseLandmarks, PoseProvider,
    evaluate,
};
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CaptureError, CaptureHandle, Frame};

use crate::monitor::{
    annotation::{CandidateBadge, Overlay, render_overlay},
    config::MonitorConfig,
    data::FramePacket,
    encoding::encode_jpeg,
    notify::{AlertSink, Cooldown, FallAlert},
    session::SessionShared,
    watchdog::HealthComponent,
};

/// Everything a pipeline thread needs besides its capture handle.
pub(crate) struct PipelineContext {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) config: Arc<MonitorConfig>,
    pub(crate) pose: Arc<dyn PoseProvider>,
    pub(crate) alerts: Arc<dyn AlertSink>,
}

/// Why the frame loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopExit {
    Stopped,
    SourceClosed,
}

/// Launch the frame loop on its own thread.
///
/// When the loop exits the capture handle is sent back through `done`. If the
/// source closed on its own, or nobody is waiting any more, the pipeline
/// releases the handle itself.
pub(crate) fn spawn_pipeline(
    ctx: PipelineContext,
    handle: CaptureHandle,
    done: Sender<CaptureHandle>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("pipeline-{}", ctx.shared.id))
        .spawn(move || {
            let span = info_span!("monitor.pipeline", session = %ctx.shared.id);
            let _enter = span.enter();
            let mut handle = handle;

            let exit = run_frame_loop(&ctx, &mut handle);
            ctx.shared.request_stop();
            if exit == LoopExit::SourceClosed {
                warn!("capture {} closed; session ends", handle.label());
                handle.release();
            }
            if let Err(returned) = done.send(handle) {
                returned.into_inner().release();
            }
            debug!(?exit, "pipeline exited");
        })
}

fn run_frame_loop(ctx: &PipelineContext, handle: &mut CaptureHandle) -> LoopExit {
    let mut processor =
        FrameProcessor::new(&ctx.config, Arc::clone(&ctx.shared), Arc::clone(&ctx.alerts));
    let health = &ctx.shared.health;

    while ctx.shared.is_running() {
        let read_started = Instant::now();
        let frame = match handle.read() {
            Ok(frame) => frame,
            // An interrupted read during stop also surfaces as Closed.
            Err(CaptureError::Closed) if !ctx.shared.is_running() => return LoopExit::Stopped,
            Err(CaptureError::Closed) => return LoopExit::SourceClosed,
            Err(err) => {
                metrics::counter!("fallwatch_capture_read_errors_total").increment(1);
                if err.is_transient() {
                    warn!("frame read failed: {err}");
                } else {
                    error!("frame read failed: {err}");
                }
                thread::sleep(ctx.config.read_retry);
                continue;
            }
        };
        record_stage("capture", read_started);
        health.beat(HealthComponent::Capture);

        let pose_started = Instant::now();
        let landmarks = match ctx.pose.detect(&frame) {
            Ok(landmarks) => landmarks,
            Err(err) => {
                metrics::counter!("fallwatch_pose_errors_total").increment(1);
                debug!("pose estimation failed: {err}");
                None
            }
        };
        record_stage("pose", pose_started);
        health.beat(HealthComponent::Pose);

        processor.process(frame, landmarks, Instant::now());
    }
    LoopExit::Stopped
}

fn record_stage(stage: &'static str, started: Instant) {
    metrics::histogram!("fallwatch_stage_latency_seconds", "stage" => stage)
        .record(started.elapsed().as_secs_f64());
}

/// Exponentially smoothed frames-per-second estimate.
#[derive(Debug, Default)]
pub(crate) struct FpsMeter {
    last: Option<Instant>,
    fps: f32,
}

impl FpsMeter {
    pub(crate) fn tick(&mut self, now: Instant) -> f32 {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.fps = if self.fps == 0.0 {
                    instant
                } else {
                    0.9 * self.fps + 0.1 * instant
                };
            }
        }
        self.last = Some(now);
        self.fps
    }
}

/// What one frame did to the session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FrameOutcome {
    /// `None` when the frame carried no landmarks.
    pub(crate) assessment: Option<FallAssessment>,
    pub(crate) transition: FallTransition,
    pub(crate) dispatched: bool,
}

/// Decision state of one session, owned by its pipeline thread.
pub(crate) struct FrameProcessor {
    shared: Arc<SessionShared>,
    alerts: Arc<dyn AlertSink>,
    thresholds: FallThresholds,
    machine: FallStateMachine,
    cooldown: Cooldown,
    fps: FpsMeter,
    jpeg_quality: u8,
    frame_number: u64,
    alarm_confidence: f32,
    session_label: String,
}

impl FrameProcessor {
    pub(crate) fn new(
        config: &MonitorConfig,
        shared: Arc<SessionShared>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let session_label = shared.id.to_string();
        Self {
            shared,
            alerts,
            thresholds: config.thresholds,
            machine: FallStateMachine::new(config.debounce_frames),
            cooldown: Cooldown::new(config.cooldown),
            fps: FpsMeter::default(),
            jpeg_quality: config.jpeg_quality,
            frame_number: 0,
            alarm_confidence: 0.0,
            session_label,
        }
    }

    /// Fold one frame into the session state, then render and publish it.
    pub(crate) fn process(
        &mut self,
        frame: Frame,
        landmarks: Option<PoseLandmarks>,
        now: Instant,
    ) -> FrameOutcome {
        let outcome = self.decide(&frame, landmarks.as_ref(), now);
        self.publish(&frame, landmarks.as_ref(), outcome.assessment, now);
        outcome
    }

    fn decide(
        &mut self,
        frame: &Frame,
        landmarks: Option<&PoseLandmarks>,
        now: Instant,
    ) -> FrameOutcome {
        metrics::counter!("fallwatch_frames_total").increment(1);
        let Some(landmarks) = landmarks else {
            return FrameOutcome {
                assessment: None,
                transition: FallTransition::Steady,
                dispatched: false,
            };
        };

        let assessment = evaluate(landmarks, &self.thresholds);
        if assessment.is_candidate {
            metrics::counter!("fallwatch_candidate_frames_total").increment(1);
        }
        let transition = self.machine.observe(assessment.is_candidate);
        if self.machine.is_fall_detected() && assessment.is_candidate {
            self.alarm_confidence = assessment.confidence;
        }

        let mut dispatched = false;
        match transition {
            FallTransition::Confirmed => {
                metrics::counter!("fallwatch_falls_confirmed_total").increment(1);
                self.alarm_confidence = assessment.confidence;
                let detected_at = Utc::now();
                self.shared.record_fall(detected_at, Arc::new(frame.clone()));
                warn!(
                    confidence = assessment.confidence,
                    criterion = assessment.strongest.map(|c| c.label()).unwrap_or("none"),
                    "fall confirmed"
                );
                if self.cooldown.try_acquire(now) {
                    self.alerts.dispatch(FallAlert {
                        session_id: self.shared.id.clone(),
                        confidence: assessment.confidence,
                        snapshot: self.shared.last_snapshot(),
                        detected_at,
                    });
                    dispatched = true;
                } else {
                    metrics::counter!(
                        "fallwatch_notifications_total",
                        "outcome" => "skipped_cooldown"
                    )
                    .increment(1);
                    info!("fall alert suppressed by cooldown");
                }
            }
            FallTransition::Cleared => info!("fall cleared"),
            FallTransition::Steady => {}
        }

        self.shared
            .record_state(self.machine.is_fall_detected(), self.machine.consecutive_candidates());
        FrameOutcome {
            assessment: Some(assessment),
            transition,
            dispatched,
        }
    }

    fn publish(
        &mut self,
        frame: &Frame,
        landmarks: Option<&PoseLandmarks>,
        assessment: Option<FallAssessment>,
        now: Instant,
    ) {
        let fps = self.fps.tick(now);
        metrics::gauge!("fallwatch_pipeline_fps").set(f64::from(fps));

        let fall_detected = self.machine.is_fall_detected();
        let candidate = assessment
            .filter(|assessment| assessment.is_candidate && !fall_detected)
            .map(|assessment| CandidateBadge {
                count: self.machine.consecutive_candidates(),
                threshold: self.machine.debounce_threshold(),
                confidence: assessment.confidence,
            });
        let overlay = Overlay {
            session_label: &self.session_label,
            fps,
            candidate,
            alarm: fall_detected.then_some(self.alarm_confidence),
            skeleton: landmarks,
        };

        let encode_started = Instant::now();
        let jpeg = render_overlay(frame, &overlay)
            .and_then(|image| encode_jpeg(&image, self.jpeg_quality));
        match jpeg {
            Ok(jpeg) => {
                self.frame_number += 1;
                self.shared.publish_frame(FramePacket {
                    jpeg: Arc::from(jpeg),
                    timestamp_ms: frame.timestamp_ms,
                    frame_number: self.frame_number,
                    fps,
                });
                record_stage("encode", encode_started);
                self.shared.health.beat(HealthComponent::Encoder);
            }
            Err(err) => warn!("failed to encode frame: {err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pose_core::{Landmark, LandmarkName};

    use super::*;
    use crate::monitor::{
        data::SessionId,
        session::tests::{RecordingSink, test_frame},
    };

    fn torso(shoulder_y: f32, hip_y: f32, nose_y: f32) -> PoseLandmarks {
        PoseLandmarks::new()
            .with(LandmarkName::Nose, Landmark::new(0.5, nose_y))
            .with(LandmarkName::LeftShoulder, Landmark::new(0.45, shoulder_y))
            .with(LandmarkName::RightShoulder, Landmark::new(0.55, shoulder_y))
            .with(LandmarkName::LeftHip, Landmark::new(0.45, hip_y))
            .with(LandmarkName::RightHip, Landmark::new(0.55, hip_y))
    }

    fn lying() -> PoseLandmarks {
        torso(0.5, 0.518, 0.3)
    }

    fn upright() -> PoseLandmarks {
        torso(0.3, 0.6, 0.1)
    }

    fn processor(cooldown: Duration) -> (FrameProcessor, Arc<SessionShared>, Arc<RecordingSink>) {
        let config = MonitorConfig {
            cooldown,
            ..MonitorConfig::default()
        };
        let shared = Arc::new(SessionShared::new(SessionId::from(9)));
        let sink = Arc::new(RecordingSink::default());
        let processor = FrameProcessor::new(&config, Arc::clone(&shared), sink.clone());
        (processor, shared, sink)
    }

    #[test]
    fn sustained_fall_confirms_once_and_drains_slowly() {
        let (mut processor, shared, sink) = processor(Duration::from_secs(30));
        let start = Instant::now();
        let tick = Duration::from_millis(33);
        let mut t = start;

        for frame in 1..=15u32 {
            t += tick;
            let outcome = processor.process(test_frame(32, 24), Some(lying()), t);
            let assessment = outcome.assessment.expect("landmarks present");
            assert!(assessment.is_candidate);
            assert!((assessment.confidence - 90.0).abs() < 0.5);
            assert_eq!(outcome.transition == FallTransition::Confirmed, frame == 12);
            assert_eq!(shared.is_fall_detected(), frame >= 12);
        }
        assert_eq!(sink.alerts.lock().unwrap().len(), 1);
        assert!(shared.fall_time().is_some());
        assert!(shared.last_snapshot().is_some());

        let mut cleared_at = None;
        for frame in 1..=20u32 {
            t += tick;
            let outcome = processor.process(test_frame(32, 24), Some(upright()), t);
            if outcome.transition == FallTransition::Cleared {
                cleared_at = Some(frame);
            }
        }
        assert_eq!(cleared_at, Some(12));
        assert!(!shared.is_fall_detected());
        assert_eq!(shared.consecutive_candidates(), 0);
        assert_eq!(sink.alerts.lock().unwrap().len(), 1);
    }

    #[test]
    fn second_episode_inside_cooldown_is_not_dispatched() {
        let (mut processor, _shared, sink) = processor(Duration::from_secs(30));
        let mut t = Instant::now();

        let episode = |processor: &mut FrameProcessor, t: &mut Instant| {
            for _ in 0..12 {
                *t += Duration::from_millis(10);
                processor.process(test_frame(16, 16), Some(lying()), *t);
            }
            for _ in 0..12 {
                *t += Duration::from_millis(10);
                processor.process(test_frame(16, 16), Some(upright()), *t);
            }
        };

        episode(&mut processor, &mut t);
        t += Duration::from_secs(10);
        episode(&mut processor, &mut t);
        assert_eq!(sink.alerts.lock().unwrap().len(), 1);

        t += Duration::from_secs(31);
        episode(&mut processor, &mut t);
        assert_eq!(sink.alerts.lock().unwrap().len(), 2);
    }

    #[test]
    fn frames_without_landmarks_leave_state_alone() {
        let (mut processor, shared, _sink) = processor(Duration::from_secs(30));
        let mut t = Instant::now();
        for _ in 0..5 {
            t += Duration::from_millis(33);
            processor.process(test_frame(16, 16), Some(lying()), t);
        }
        for _ in 0..50 {
            t += Duration::from_millis(33);
            let outcome = processor.process(test_frame(16, 16), None, t);
            assert_eq!(outcome.assessment, None);
            assert_eq!(outcome.transition, FallTransition::Steady);
        }
        assert_eq!(shared.consecutive_candidates(), 5);
        assert!(shared.latest_frame().is_some());
    }

    #[test]
    fn published_frames_replace_each_other() {
        let (mut processor, shared, _sink) = processor(Duration::from_secs(30));
        let t = Instant::now();
        processor.process(test_frame(16, 16), None, t);
        processor.process(test_frame(16, 16), None, t + Duration::from_millis(50));
        let packet = shared.latest_frame().expect("published");
        assert_eq!(packet.frame_number, 2);
        assert!((packet.fps - 20.0).abs() < 0.01);
    }

    #[test]
    fn fps_meter_smooths_samples() {
        let mut meter = FpsMeter::default();
        let t = Instant::now();
        assert_eq!(meter.tick(t), 0.0);
        assert!((meter.tick(t + Duration::from_millis(100)) - 10.0).abs() < 0.01);
        let smoothed = meter.tick(t + Duration::from_millis(150));
        assert!((smoothed - 11.0).abs() < 0.01);
    }
}
