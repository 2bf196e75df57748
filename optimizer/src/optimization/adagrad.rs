use std::path::Path;

use log::{info, warn};

use super::{Optimizer, StepContext, check_grads, check_state_len, shard_at, shard_at_mut};
use crate::{
    alloc::BufferAllocator,
    buffer::Buffer,
    checkpoint::{self, Item},
    device::Device,
    dtype::DType,
    error::{OptimErr, Result},
    persistence::{GatherState, ScatterState},
};

/// Adagrad, <http://www.jmlr.org/papers/volume12/duchi11a/duchi11a.pdf>.
///
/// Keeps the running sum of squared gradients `gt` and scales every coordinate's step by its
/// inverse square root.
#[derive(Debug)]
pub struct Adagrad {
    eps: f32,
    alloc: Option<BufferAllocator>,
    gt: Option<Buffer>,
}

impl Default for Adagrad {
    fn default() -> Self {
        Self::new()
    }
}

impl Adagrad {
    /// The checkpoint item holding `gt`.
    pub const GT_ITEM: &'static str = "adagrad_gt";

    /// Creates a new `Adagrad` optimizer with `eps = 1e-8`.
    ///
    /// The accumulator is allocated on the first update, once the parameter count is known.
    pub fn new() -> Self {
        Self {
            eps: 1e-8,
            alloc: None,
            gt: None,
        }
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// The squared gradient accumulator, `None` until the first update or load.
    pub fn gt(&self) -> Option<&Buffer> {
        self.gt.as_ref()
    }

    /// Returns the accumulator, allocating it zeroed if needed.
    ///
    /// # Arguments
    /// * `device` - The device backing the shard.
    /// * `len` - The amount of parameters in the shard.
    /// * `dtype` - The element type of the accumulator.
    fn state(&mut self, device: &Device, len: usize, dtype: DType) -> Result<&mut Buffer> {
        let gt = match self.gt.take() {
            Some(gt) => gt,
            None => {
                let alloc = self
                    .alloc
                    .get_or_insert_with(|| BufferAllocator::new(device.clone()));
                alloc.reserve_exact(len * dtype.size());
                alloc.allocate(len, dtype)?
            }
        };

        Ok(self.gt.insert(gt))
    }

    /// Gathers `gt` from every shard and writes it to `path`.
    ///
    /// # Arguments
    /// * `path` - The checkpoint file.
    /// * `opts` - The optimizer of every local shard, in shard order.
    /// * `gather` - Concatenates the per-shard state.
    /// * `is_main` - Only the main process writes, the others gather and discard.
    pub fn save<P: AsRef<Path>>(
        path: P,
        opts: &[&Adagrad],
        gather: &dyn GatherState,
        is_main: bool,
    ) -> Result<()> {
        let path = path.as_ref();

        if opts.iter().any(|opt| opt.gt.is_none()) {
            warn!("Adagrad state not allocated yet, nothing to save");
            return Ok(());
        }

        if is_main {
            info!("saving Adagrad state to {}", path.display());
        }

        let gt = gather.gather(&mut |i| {
            let opt = shard_at(opts, i)?;
            Ok(opt.gt.as_ref().map(Buffer::to_f32_vec).unwrap_or_default())
        })?;

        if !is_main {
            return Ok(());
        }

        checkpoint::save_items(path, &[Item::from_f32(Self::GT_ITEM, &gt)])
    }

    /// Reads `gt` from `path` and scatters it across the shards.
    ///
    /// A missing file or a file without `gt` leaves the state untouched.
    ///
    /// # Arguments
    /// * `path` - The checkpoint file.
    /// * `opts` - The optimizer of every local shard, in shard order.
    /// * `backends` - The device of every local shard, in shard order.
    /// * `scatter` - Splits the global state into per-shard ranges.
    pub fn load<P: AsRef<Path>>(
        path: P,
        opts: &mut [&mut Adagrad],
        backends: &[Device],
        scatter: &dyn ScatterState,
    ) -> Result<()> {
        let path = path.as_ref();

        if opts.len() != backends.len() {
            return Err(OptimErr::ShardCountMismatch {
                rules: opts.len(),
                backends: backends.len(),
            });
        }

        if !path.exists() {
            return Ok(());
        }

        info!("loading Adagrad state from {}", path.display());

        let mut gt = Vec::new();
        for item in checkpoint::load_items(path)? {
            if item.name == Self::GT_ITEM {
                gt = item.to_f32_vec()?;
            }
        }

        if gt.is_empty() {
            warn!("Adagrad state not found in {}", path.display());
            return Ok(());
        }

        // Dry run, no shard is touched unless every shard accepts its range.
        scatter.scatter(&gt, &mut |i, range| {
            let opt = shard_at(opts, i)?;
            check_state_len(opt.gt.as_ref(), range.len())
        })?;

        scatter.scatter(&gt, &mut |i, range| {
            let device = shard_at(backends, i)?;
            let opt = shard_at_mut(opts, i)?;
            opt.state(device, range.len(), DType::Float32)?
                .set_f32(range)
        })
    }
}

impl Optimizer for Adagrad {
    fn name(&self) -> &'static str {
        "adagrad"
    }

    fn step(&mut self, params: &mut Buffer, grads: &Buffer, ctx: StepContext) -> Result<()> {
        if ctx.mb_size != ctx.ref_mb_words {
            return Err(OptimErr::MiniBatchRescaling {
                rule: "adagrad",
                actual: ctx.mb_size,
                reference: ctx.ref_mb_words,
            });
        }

        check_grads(params, grads)?;

        // Keep eps away from the smallest normal value of narrow types, or the update divides by 0.
        self.eps = self.eps.max(params.dtype().min_positive() * 2.);

        let (eta, eps) = (ctx.eta, self.eps);
        let gt = self.state(params.device(), params.len(), params.dtype())?;

        gt.zip_apply(grads, |acc, g| acc + g * g)?;
        params.zip_apply2(gt, grads, |p, acc, g| p - (eta / (acc.sqrt() + eps)) * g)
    }

    fn supports_rescaling(&self) -> bool {
        false
    }

    fn reset_stats(&mut self) {
        if let Some(gt) = self.gt.as_mut() {
            gt.fill(0.);
        }
    }

    fn set_params(&mut self, params: &[f32]) {
        if let Some(&eps) = params.first() {
            self.eps = eps;
        }
    }
}
