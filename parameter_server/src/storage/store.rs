use std::{
    num::NonZeroUsize,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use log::{debug, info};
use optimizer::{
    Buffer, DType, Device, GatherState, OptimizerConfig, ScatterState, ShardLayout, TrainingEvent,
    TrainingState, UpdateEngine, UpdateRule,
};
use parking_lot::MutexGuard;
use rayon::prelude::*;

use crate::storage::{ParameterShard, Result, StoreErr};

/// The primary storage of parameters and accumulated gradients.
///
/// Parameters are split into shards of at most `shard_size` elements, each one on its own
/// device and with its own `UpdateEngine`.
#[derive(Debug)]
pub struct ParameterStore {
    params: usize,
    active_idx: Arc<AtomicU8>,
    updating: Arc<AtomicBool>,
    shards: Arc<[ParameterShard]>,
    shard_size: NonZeroUsize,
    layout: ShardLayout,
}

impl Clone for ParameterStore {
    fn clone(&self) -> Self {
        Self {
            params: self.params,
            active_idx: Arc::clone(&self.active_idx),
            updating: Arc::clone(&self.updating),
            shards: Arc::clone(&self.shards),
            shard_size: self.shard_size,
            layout: self.layout.clone(),
        }
    }
}

impl ParameterStore {
    /// Creates a new `ParameterStore`.
    ///
    /// # Arguments
    /// * `initial` - The initial value of every parameter.
    /// * `dtype` - The element type parameters are stored in.
    /// * `shard_size` - The maximum amount of parameters per shard.
    /// * `config` - The configuration of every shard's update engine.
    /// * `device_factory` - Returns the device of the given shard index.
    ///
    /// # Returns
    /// A new `ParameterStore` or an error if the engine can't be built from `config`.
    pub fn new<F>(
        initial: &[f32],
        dtype: DType,
        shard_size: NonZeroUsize,
        config: &OptimizerConfig,
        mut device_factory: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> Device,
    {
        let layout = ShardLayout::chunked(initial.len(), shard_size);

        let shards = initial
            .chunks(shard_size.get())
            .enumerate()
            .map(|(idx, values)| -> Result<ParameterShard> {
                let params = Buffer::from_f32(device_factory(idx), dtype, values)?;
                let engine = UpdateEngine::from_config(config)?;
                ParameterShard::new(params, engine)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            params = initial.len(),
            shards = shards.len(),
            optimizer = config.optimizer.as_str();
            "parameter store ready"
        );

        Ok(Self {
            params: initial.len(),
            active_idx: Arc::new(AtomicU8::new(0)),
            updating: Arc::new(AtomicBool::new(false)),
            shards: Arc::from(shards),
            shard_size,
            layout,
        })
    }

    /// Returns the size of the storage.
    ///
    /// # Returns
    /// The amount of parameters in the storage.
    pub fn len(&self) -> usize {
        self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params == 0
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// The element count of every shard, in shard order.
    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    /// Accumulates a new gradient into the active gradient buffer.
    ///
    /// # Arguments
    /// * `grad` - A flat slice containing a new model gradient.
    ///
    /// # Returns
    /// A `SizeMismatch` error if the length of `grad` doesn't match the amount of parameters.
    pub fn accumulate(&self, grad: &[f32]) -> Result<()> {
        self.check_len(grad.len())?;
        let active_idx = self.active_idx.load(Ordering::Acquire) as usize;

        self.shards
            .par_iter()
            .zip(grad.par_chunks(self.shard_size.get()))
            .try_for_each(|(shard, grad_slice)| shard.accumulate(active_idx, grad_slice))
    }

    /// Swaps the active gradient buffer and applies the frozen gradient to the parameters.
    ///
    /// This triggers a parallel update across all shards. Does nothing if another update is
    /// already in flight.
    ///
    /// # Arguments
    /// * `mb_size` - The size of the minibatch the gradient was accumulated over.
    pub fn update_params(&self, mb_size: Option<usize>) -> Result<()> {
        let success = self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();

        if !success {
            debug!("update already in flight, skipping");
            return Ok(());
        }

        let frozen_idx = self.active_idx.fetch_xor(1, Ordering::AcqRel) as usize;

        let result = self
            .shards
            .par_iter()
            .try_for_each(|shard| shard.update_params(frozen_idx, mb_size));

        self.updating.store(false, Ordering::Release);
        result
    }

    /// Gathers all the sharded parameters into a local buffer.
    ///
    /// # Arguments
    /// * `out` - A mutable slice where the parameters will be copied.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `out` doesn't have one slot per parameter.
    pub fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        self.check_len(out.len())?;

        self.shards
            .par_iter()
            .zip(out.par_chunks_mut(self.shard_size.get()))
            .try_for_each(|(shard, out_slice)| shard.pull_params(out_slice))
    }

    /// Gathers the exponentially smoothed parameters into a local buffer.
    ///
    /// # Returns
    /// `false` if smoothing is disabled or no update ran yet, `out` is left partially written
    /// in that case.
    pub fn pull_averaged_params(&self, out: &mut [f32]) -> Result<bool> {
        self.check_len(out.len())?;

        let found = self
            .shards
            .par_iter()
            .zip(out.par_chunks_mut(self.shard_size.get()))
            .map(|(shard, out_slice)| shard.pull_averaged_params(out_slice))
            .collect::<Result<Vec<_>>>()?;

        Ok(found.into_iter().all(|found| found))
    }

    /// Forwards a training loop event to every shard's engine.
    pub fn observe(&self, event: TrainingEvent, state: &TrainingState) {
        self.shards
            .par_iter()
            .for_each(|shard| shard.observe(event, state));
    }

    /// Writes the optimizer state of every shard to `path`.
    ///
    /// Every engine stays locked for the whole save, gather sees a consistent snapshot.
    ///
    /// # Arguments
    /// * `path` - The checkpoint file.
    /// * `is_main` - Whether this is the process that writes the file.
    pub fn save_optimizer<P: AsRef<Path>>(&self, path: P, is_main: bool) -> Result<()> {
        let engines = self.lock_engines();
        let rules: Vec<&UpdateRule> = engines.iter().map(|engine| engine.rule()).collect();

        UpdateRule::save(path, &rules, self, is_main)?;
        Ok(())
    }

    /// Restores the optimizer state of every shard from `path`.
    ///
    /// The checkpoint may have been written by a store with another shard size, the state is
    /// redistributed over the current shards.
    pub fn load_optimizer<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut engines = self.lock_engines();
        let mut rules: Vec<&mut UpdateRule> =
            engines.iter_mut().map(|engine| engine.rule_mut()).collect();
        let backends: Vec<Device> = self
            .shards
            .iter()
            .map(|shard| shard.device().clone())
            .collect();

        UpdateRule::load(path, &mut rules, &backends, self)?;
        Ok(())
    }

    /// Locks every shard's engine, in shard order.
    fn lock_engines(&self) -> Vec<MutexGuard<'_, UpdateEngine>> {
        self.shards.iter().map(ParameterShard::lock_engine).collect()
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.params {
            return Err(StoreErr::SizeMismatch {
                got,
                expected: self.params,
            });
        }

        Ok(())
    }
}

impl GatherState for ParameterStore {
    fn gather(
        &self,
        get: &mut dyn FnMut(usize) -> optimizer::Result<Vec<f32>>,
    ) -> optimizer::Result<Vec<f32>> {
        debug!(shards = self.shards.len(); "gathering optimizer state");
        self.layout.gather(get)
    }
}

impl ScatterState for ParameterStore {
    fn scatter(
        &self,
        data: &[f32],
        set: &mut dyn FnMut(usize, &[f32]) -> optimizer::Result<()>,
    ) -> optimizer::Result<()> {
        debug!(shards = self.shards.len(), elements = data.len(); "scattering optimizer state");
        self.layout.scatter(data, set)
    }
}
