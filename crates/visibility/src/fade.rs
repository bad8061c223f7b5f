#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FadePhase {
    Entering,
    Steady,
    Exiting,
}

/// LOD transition progress for one shown tile. Progress comes from the
/// tile's own fade fraction, never from a reconciler clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeState {
    pub phase: FadePhase,
    pub progress: f32,
}

impl FadeState {
    pub const STEADY: FadeState = FadeState {
        phase: FadePhase::Steady,
        progress: 1.0,
    };

    pub fn entering(progress: f32) -> Self {
        let progress = sanitize(progress);
        if progress >= 1.0 {
            return Self::STEADY;
        }
        Self {
            phase: FadePhase::Entering,
            progress,
        }
    }

    /// Advance an exit fade. Progress never moves backwards while the tile
    /// keeps fading out.
    pub fn exiting(previous: Option<FadeState>, progress: f32) -> Self {
        let progress = sanitize(progress);
        let progress = match previous {
            Some(FadeState {
                phase: FadePhase::Exiting,
                progress: before,
            }) => progress.max(before),
            _ => progress,
        };
        Self {
            phase: FadePhase::Exiting,
            progress,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }
}

fn sanitize(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_progress_never_regresses() {
        let first = FadeState::exiting(None, 0.6);
        let second = FadeState::exiting(Some(first), 0.2);
        assert_eq!(second.progress, 0.6);

        let restarted = FadeState::exiting(Some(FadeState::entering(0.9)), 0.1);
        assert_eq!(restarted.progress, 0.1);
    }

    #[test]
    fn finished_entry_is_steady() {
        assert_eq!(FadeState::entering(1.0), FadeState::STEADY);
        assert_eq!(FadeState::entering(f32::NAN).progress, 0.0);
    }
}
