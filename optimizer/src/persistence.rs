//! Moves flat optimizer state between one global host vector and per-shard buffers.
//!
//! The optimizer never knows how the parameters are split across devices. The coordinator that
//! owns the shards implements `GatherState` and `ScatterState` and the update rules only
//! orchestrate calls to them.

use std::num::NonZeroUsize;

use crate::error::{OptimErr, Result};

/// Concatenates per-shard state into a single global vector.
pub trait GatherState {
    /// Calls `get` once per shard, in shard order, and concatenates the results.
    ///
    /// # Arguments
    /// * `get` - Returns the local state of the given shard index.
    fn gather(&self, get: &mut dyn FnMut(usize) -> Result<Vec<f32>>) -> Result<Vec<f32>>;
}

/// Splits a global state vector into contiguous per-shard ranges.
pub trait ScatterState {
    /// Calls `set` once per shard, in shard order, with that shard's sub-range of `data`.
    ///
    /// # Arguments
    /// * `data` - The global state vector.
    /// * `set` - Stores a sub-range into the given shard index.
    ///
    /// # Returns
    /// A `SizeMismatch` error, before any call to `set`, if the shards don't cover `data` exactly.
    fn scatter(&self, data: &[f32], set: &mut dyn FnMut(usize, &[f32]) -> Result<()>)
    -> Result<()>;
}

/// The element count of every shard, in shard order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    sizes: Vec<usize>,
}

impl ShardLayout {
    /// Creates a new `ShardLayout` from explicit shard sizes.
    pub fn from_sizes(sizes: Vec<usize>) -> Self {
        Self { sizes }
    }

    /// Splits `total` elements into shards of `shard_size`, the last one takes the remainder.
    ///
    /// # Arguments
    /// * `total` - The amount of parameters.
    /// * `shard_size` - The maximum amount of parameters per shard.
    pub fn chunked(total: usize, shard_size: NonZeroUsize) -> Self {
        let shard_size = shard_size.get();
        let sizes = (0..total)
            .step_by(shard_size)
            .map(|start| shard_size.min(total - start))
            .collect();

        Self { sizes }
    }

    pub fn num_shards(&self) -> usize {
        self.sizes.len()
    }

    pub fn shard_len(&self, shard: usize) -> Option<usize> {
        self.sizes.get(shard).copied()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// The amount of elements across all shards.
    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }
}

impl GatherState for ShardLayout {
    fn gather(&self, get: &mut dyn FnMut(usize) -> Result<Vec<f32>>) -> Result<Vec<f32>> {
        let mut data = Vec::with_capacity(self.total());

        for (shard, &expected) in self.sizes.iter().enumerate() {
            let local = get(shard)?;

            if local.len() != expected {
                return Err(OptimErr::SizeMismatch {
                    a: "shard state",
                    b: "shard layout",
                    got: local.len(),
                    expected,
                });
            }

            data.extend_from_slice(&local);
        }

        Ok(data)
    }
}

impl ScatterState for ShardLayout {
    fn scatter(
        &self,
        data: &[f32],
        set: &mut dyn FnMut(usize, &[f32]) -> Result<()>,
    ) -> Result<()> {
        if data.len() != self.total() {
            return Err(OptimErr::SizeMismatch {
                a: "global state",
                b: "shard layout",
                got: data.len(),
                expected: self.total(),
            });
        }

        let mut offset = 0;
        for (shard, &len) in self.sizes.iter().enumerate() {
            set(shard, &data[offset..offset + len])?;
            offset += len;
        }

        Ok(())
    }
}
