use std::fmt::Debug;

use crate::buffer::Buffer;

/// Rescales a gradient in place so that a derived norm doesn't exceed a bound.
pub trait Clipper: Debug + Send {
    /// Clips `grads` in place.
    ///
    /// # Returns
    /// The norm of the gradient before clipping.
    fn clip(&self, grads: &mut Buffer) -> f32;
}

/// Clips by the L2 norm of the whole gradient.
#[derive(Debug, Clone, Copy)]
pub struct NormClipper {
    max_norm: f32,
}

impl NormClipper {
    /// Creates a new `NormClipper`.
    ///
    /// # Arguments
    /// * `max_norm` - The largest L2 norm a gradient may keep.
    ///
    /// # Returns
    /// A new `NormClipper` instance.
    pub fn new(max_norm: f32) -> Self {
        Self { max_norm }
    }

    pub fn max_norm(&self) -> f32 {
        self.max_norm
    }
}

impl Clipper for NormClipper {
    fn clip(&self, grads: &mut Buffer) -> f32 {
        let norm = grads.sum_squares().sqrt() as f32;

        if norm >= self.max_norm {
            let scale = self.max_norm / norm;
            grads.map_inplace(|g| g * scale);
        }

        norm
    }
}
