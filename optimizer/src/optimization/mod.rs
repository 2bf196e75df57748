mod adagrad;
mod adam;
mod optimizer;
mod rule;
mod sgd;

pub use adagrad::Adagrad;
pub use adam::Adam;
pub use optimizer::{Optimizer, StepContext};
pub use rule::UpdateRule;
pub use sgd::Sgd;

use crate::{
    buffer::Buffer,
    error::{OptimErr, Result},
};

/// Checks that the gradient can be applied to the parameters.
fn check_grads(params: &Buffer, grads: &Buffer) -> Result<()> {
    if grads.len() != params.len() {
        return Err(OptimErr::SizeMismatch {
            a: "gradient",
            b: "parameters",
            got: grads.len(),
            expected: params.len(),
        });
    }

    if grads.dtype() != params.dtype() {
        return Err(OptimErr::DTypeMismatch {
            expected: params.dtype(),
            got: grads.dtype(),
        });
    }

    Ok(())
}

/// Checks that an already allocated state buffer can hold `expected` elements.
///
/// State that doesn't exist yet is always accepted, it will be allocated with the right size.
fn check_state_len(state: Option<&Buffer>, expected: usize) -> Result<()> {
    match state {
        Some(state) if state.len() != expected => Err(OptimErr::SizeMismatch {
            a: "loaded state",
            b: "optimizer state",
            got: expected,
            expected: state.len(),
        }),
        _ => Ok(()),
    }
}

fn shard_at<T>(shards: &[T], shard: usize) -> Result<&T> {
    let len = shards.len();
    shards.get(shard).ok_or(OptimErr::SizeMismatch {
        a: "shard layout",
        b: "optimizer shards",
        got: shard + 1,
        expected: len,
    })
}

fn shard_at_mut<T>(shards: &mut [T], shard: usize) -> Result<&mut T> {
    let len = shards.len();
    shards.get_mut(shard).ok_or(OptimErr::SizeMismatch {
        a: "shard layout",
        b: "optimizer shards",
        got: shard + 1,
        expected: len,
    })
}
