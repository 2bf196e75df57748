use crate::{buffer::Buffer, error::Result};

/// Keeps an exponential moving average of the parameters alongside the trained values.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialSmoothing {
    decay: f32,
    ref_batch_words: usize,
}

impl ExponentialSmoothing {
    /// Creates a new `ExponentialSmoothing`.
    ///
    /// # Arguments
    /// * `decay` - Weight of the newest parameters in the average, `0` disables smoothing.
    /// * `ref_batch_words` - The minibatch size `decay` was tuned for, `0` disables the correction.
    ///
    /// # Returns
    /// `None` when `decay` is `0`.
    pub fn new(decay: f32, ref_batch_words: usize) -> Option<Self> {
        (decay > 0.).then_some(Self {
            decay,
            ref_batch_words,
        })
    }

    /// The weight given to the current parameters for this step.
    ///
    /// Larger minibatches than the reference count as several reference steps, and the
    /// first batches average uniformly so the average isn't biased towards its zero start.
    pub fn beta(&self, batches: usize, mb_size: usize) -> f64 {
        let mut beta = self.decay as f64;

        if self.ref_batch_words > 0 {
            let steps = mb_size as f64 / self.ref_batch_words as f64;
            beta = 1. - (1. - beta).powf(steps);
        }

        beta.max(1. / (batches as f64 + 1.))
    }

    /// Blends `params` into `avg`: `avg = (1 - beta) * avg + beta * params`.
    ///
    /// # Arguments
    /// * `avg` - The averaged parameters.
    /// * `params` - The freshly updated parameters.
    /// * `batches` - The amount of batches seen so far.
    /// * `mb_size` - The size of the current minibatch.
    pub fn update_avg_params(
        &self,
        avg: &mut Buffer,
        params: &Buffer,
        batches: usize,
        mb_size: usize,
    ) -> Result<()> {
        let beta = self.beta(batches, mb_size) as f32;
        avg.zip_apply(params, |a, p| (1. - beta) * a + beta * p)
    }
}
