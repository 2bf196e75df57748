use crate::{buffer::Buffer, error::Result};

/// Per step inputs shared by every update rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    /// The current learning rate.
    pub eta: f32,
    /// The amount of reference units (tokens, samples) in this step's minibatch.
    pub mb_size: usize,
    /// The minibatch size the hyper-parameters were tuned for.
    pub ref_mb_words: usize,
}

impl StepContext {
    /// A context without minibatch-size normalization.
    pub fn new(eta: f32) -> Self {
        Self {
            eta,
            mb_size: 1,
            ref_mb_words: 1,
        }
    }
}

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer {
    /// The configuration name of the rule.
    fn name(&self) -> &'static str;

    /// Updates the provided parameters in place using the gradient.
    ///
    /// # Arguments
    /// * `params` - The parameters to update.
    /// * `grads` - The gradient, same length as `params`.
    /// * `ctx` - Learning rate and minibatch sizes for this step.
    ///
    /// # Returns
    /// An error if a precondition of the rule doesn't hold, nothing is mutated in that case.
    fn step(&mut self, params: &mut Buffer, grads: &Buffer, ctx: StepContext) -> Result<()>;

    /// Whether the rule accepts a minibatch size different from the reference one.
    fn supports_rescaling(&self) -> bool {
        true
    }

    /// Zeroes every statistic accumulated across steps.
    fn reset_stats(&mut self);

    /// Applies positional hyper-parameters, missing positions keep their current value.
    fn set_params(&mut self, params: &[f32]);
}
