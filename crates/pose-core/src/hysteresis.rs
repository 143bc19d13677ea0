//! Debounce for per-frame fall candidates.
//!
//! The counter rises by one per candidate frame up to the debounce threshold
//! and decays by one per non-candidate frame down to zero. A fall is confirmed
//! when the counter reaches the threshold and is cleared only once it drains
//! back to zero, so the alarm holds while the counter is on its way down.

/// Effect of a single observation on the alarm state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallTransition {
    Steady,
    /// Counter reached the threshold while no fall was active.
    Confirmed,
    /// Counter drained to zero while a fall was active.
    Cleared,
}

#[derive(Clone, Debug)]
pub struct FallStateMachine {
    debounce_threshold: u32,
    consecutive: u32,
    fall_detected: bool,
}

impl FallStateMachine {
    pub fn new(debounce_threshold: u32) -> Self {
        Self {
            debounce_threshold: debounce_threshold.max(1),
            consecutive: 0,
            fall_detected: false,
        }
    }

    /// Feed the outcome of one evaluated frame.
    pub fn observe(&mut self, is_candidate: bool) -> FallTransition {
        if is_candidate {
            self.consecutive = (self.consecutive + 1).min(self.debounce_threshold);
        } else {
            self.consecutive = self.consecutive.saturating_sub(1);
        }

        if self.consecutive >= self.debounce_threshold && !self.fall_detected {
            self.fall_detected = true;
            return FallTransition::Confirmed;
        }
        if self.consecutive == 0 && self.fall_detected {
            self.fall_detected = false;
            return FallTransition::Cleared;
        }
        FallTransition::Steady
    }

    pub fn consecutive_candidates(&self) -> u32 {
        self.consecutive
    }

    pub fn debounce_threshold(&self) -> u32 {
        self.debounce_threshold
    }

    pub fn is_fall_detected(&self) -> bool {
        self.fall_detected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirms_exactly_at_threshold() {
        let mut machine = FallStateMachine::new(12);
        for frame in 1..=11 {
            assert_eq!(machine.observe(true), FallTransition::Steady, "frame {frame}");
            assert!(!machine.is_fall_detected());
        }
        assert_eq!(machine.observe(true), FallTransition::Confirmed);
        assert!(machine.is_fall_detected());
    }

    #[test]
    fn counter_is_capped_and_alarm_holds_until_drained() {
        let mut machine = FallStateMachine::new(12);
        let transitions: Vec<_> = (0..15).map(|_| machine.observe(true)).collect();
        assert_eq!(
            transitions
                .iter()
                .filter(|t| **t == FallTransition::Confirmed)
                .count(),
            1
        );
        assert_eq!(transitions[11], FallTransition::Confirmed);
        assert_eq!(machine.consecutive_candidates(), 12);

        for frame in 1..=20 {
            let transition = machine.observe(false);
            if frame < 12 {
                assert_eq!(transition, FallTransition::Steady, "frame {frame}");
                assert!(machine.is_fall_detected(), "frame {frame}");
            } else if frame == 12 {
                assert_eq!(transition, FallTransition::Cleared);
                assert!(!machine.is_fall_detected());
            } else {
                assert_eq!(transition, FallTransition::Steady);
                assert_eq!(machine.consecutive_candidates(), 0);
            }
        }
    }

    #[test]
    fn partial_recovery_does_not_retrigger() {
        let mut machine = FallStateMachine::new(4);
        for _ in 0..4 {
            machine.observe(true);
        }
        assert!(machine.is_fall_detected());
        machine.observe(false);
        machine.observe(false);
        assert_eq!(machine.observe(true), FallTransition::Steady);
        assert_eq!(machine.observe(true), FallTransition::Steady);
        assert_eq!(machine.consecutive_candidates(), 4);
        assert!(machine.is_fall_detected());
    }

    #[test]
    fn alternating_frames_never_confirm() {
        let mut machine = FallStateMachine::new(3);
        for _ in 0..50 {
            assert_ne!(machine.observe(true), FallTransition::Confirmed);
            machine.observe(false);
        }
        assert_eq!(machine.consecutive_candidates(), 0);
    }

    #[test]
    fn counter_never_goes_negative() {
        let mut machine = FallStateMachine::new(5);
        for _ in 0..10 {
            assert_eq!(machine.observe(false), FallTransition::Steady);
        }
        assert_eq!(machine.consecutive_candidates(), 0);
        assert!(!machine.is_fall_detected());
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let mut machine = FallStateMachine::new(0);
        assert_eq!(machine.debounce_threshold(), 1);
        assert_eq!(machine.observe(true), FallTransition::Confirmed);
        assert_eq!(machine.observe(false), FallTransition::Cleared);
    }
}
