/// The points of the training loop at which the optimizer is notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingEvent {
    Init,
    AfterLoaded,
    AfterEpoch,
    AfterBatches,
    AfterStalled,
}

impl TrainingEvent {
    /// Whether the event carries the cumulative batch count.
    pub fn carries_batches(self) -> bool {
        matches!(self, TrainingEvent::AfterBatches)
    }

    /// Whether the event may request an optimizer state reset.
    pub fn may_reset(self) -> bool {
        matches!(
            self,
            TrainingEvent::AfterEpoch | TrainingEvent::AfterBatches | TrainingEvent::AfterStalled
        )
    }
}

/// The training state pushed into the optimizer with every event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    /// The current learning rate.
    pub eta: f32,
    /// Batches processed so far.
    pub batches: usize,
    /// Requests the optimizer statistics to be reset.
    pub reset: bool,
}

impl TrainingState {
    pub fn new(eta: f32) -> Self {
        Self {
            eta,
            batches: 0,
            reset: false,
        }
    }
}
