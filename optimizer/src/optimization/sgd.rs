use super::{Optimizer, StepContext};
use crate::{buffer::Buffer, error::Result};

/// Plain stochastic gradient descent: `params -= eta * grads`.
///
/// The minibatch ratio is ignored, the gradient is expected to be normalized upstream.
#[derive(Debug, Default)]
pub struct Sgd;

impl Sgd {
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn step(&mut self, params: &mut Buffer, grads: &Buffer, ctx: StepContext) -> Result<()> {
        let eta = ctx.eta;
        params.zip_apply(grads, |p, g| p - eta * g)
    }

    fn reset_stats(&mut self) {}

    fn set_params(&mut self, _params: &[f32]) {}
}
