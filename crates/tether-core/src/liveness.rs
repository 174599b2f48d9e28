use std::fmt;

/// Consecutive missed ping rounds for one subscriber.
///
/// ```text
/// Fresh ──miss──► OneMiss ──miss──► TwoMiss ──miss──► dead
///   ▲                │                 │
///   └──────pong──────┴──────pong───────┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LivenessState {
    #[default]
    Fresh,
    OneMiss,
    TwoMiss,
}

impl LivenessState {
    /// Records one failed round.
    ///
    /// Returns `false` when the subscriber has exhausted its misses; the state
    /// is left at `TwoMiss` and the caller is expected to kill the subscription.
    pub fn advance(&mut self) -> bool {
        match self {
            LivenessState::Fresh => {
                *self = LivenessState::OneMiss;
                true
            }
            LivenessState::OneMiss => {
                *self = LivenessState::TwoMiss;
                true
            }
            LivenessState::TwoMiss => false,
        }
    }

    pub fn reset(&mut self) {
        *self = LivenessState::Fresh;
    }

    pub fn misses(self) -> u8 {
        match self {
            LivenessState::Fresh => 0,
            LivenessState::OneMiss => 1,
            LivenessState::TwoMiss => 2,
        }
    }

    /// Inverse of [`LivenessState::misses`], saturating at `TwoMiss`.
    pub fn from_misses(misses: u8) -> Self {
        match misses {
            0 => LivenessState::Fresh,
            1 => LivenessState::OneMiss,
            _ => LivenessState::TwoMiss,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LivenessState::Fresh => "fresh",
            LivenessState::OneMiss => "one_miss",
            LivenessState::TwoMiss => "two_miss",
        }
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
