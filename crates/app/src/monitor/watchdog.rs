use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 1_500;
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HealthComponent {
    Capture,
    Pose,
    Encoder,
}

impl HealthComponent {
    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Pose => "pose",
            HealthComponent::Encoder => "encoding",
        }
    }
}

/// Last-progress timestamps for each pipeline stage.
pub(crate) struct PipelineHealth {
    capture: AtomicU64,
    pose: AtomicU64,
    encoder: AtomicU64,
}

impl PipelineHealth {
    pub(crate) fn new() -> Self {
        Self::starting_at(current_millis())
    }

    fn starting_at(now: u64) -> Self {
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            capture: AtomicU64::new(grace_deadline),
            pose: AtomicU64::new(grace_deadline),
            encoder: AtomicU64::new(grace_deadline),
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    fn beat_at(&self, component: HealthComponent, now: u64) {
        match component {
            HealthComponent::Capture => self.capture.store(now, Ordering::Relaxed),
            HealthComponent::Pose => self.pose.store(now, Ordering::Relaxed),
            HealthComponent::Encoder => self.encoder.store(now, Ordering::Relaxed),
        }
    }

    /// First stage, in pipeline order, that has not progressed recently.
    pub(crate) fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        [
            (HealthComponent::Capture, &self.capture),
            (HealthComponent::Pose, &self.pose),
            (HealthComponent::Encoder, &self.encoder),
        ]
        .into_iter()
        .find(|(_, last)| {
            now.saturating_sub(last.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS
        })
        .map(|(component, _)| component)
    }
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pipeline_is_within_grace() {
        let health = PipelineHealth::starting_at(10_000);
        assert_eq!(health.stale_component(10_000 + WATCHDOG_STARTUP_GRACE_MS), None);
        let past_threshold = 10_000 + WATCHDOG_STARTUP_GRACE_MS + WATCHDOG_STALE_THRESHOLD_MS + 1;
        assert_eq!(
            health.stale_component(past_threshold),
            Some(HealthComponent::Capture)
        );
    }

    #[test]
    fn reports_first_stalled_stage() {
        let health = PipelineHealth::starting_at(0);
        let now = 60_000;
        health.beat_at(HealthComponent::Capture, now);
        health.beat_at(HealthComponent::Pose, now - 2_000);
        health.beat_at(HealthComponent::Encoder, now - 3_000);
        assert_eq!(health.stale_component(now), Some(HealthComponent::Pose));
        health.beat_at(HealthComponent::Pose, now);
        assert_eq!(health.stale_component(now), Some(HealthComponent::Encoder));
        health.beat_at(HealthComponent::Encoder, now);
        assert_eq!(health.stale_component(now), None);
    }
}
