use optimizer::{Buffer, DType, Device, TrainingEvent, TrainingState, UpdateEngine};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::storage::{Result, StoreErr};

/// A slice of the parameters living on one device, with the gradients accumulated for it
/// and the engine that updates it.
#[derive(Debug)]
pub struct ParameterShard {
    len: usize,
    device: Device,
    grads: [Mutex<Buffer>; 2],
    params: RwLock<Buffer>,
    engine: Mutex<UpdateEngine>,
}

impl ParameterShard {
    /// Creates a new `ParameterShard`.
    ///
    /// # Arguments
    /// * `params` - The initial state of the parameters, its device and element type are the
    ///   shard's.
    /// * `engine` - The update engine of this shard.
    pub fn new(params: Buffer, engine: UpdateEngine) -> Result<Self> {
        let len = params.len();
        let device = params.device().clone();
        let zeros = || Buffer::zeros(device.clone(), params.dtype(), len);

        Ok(Self {
            len,
            grads: [Mutex::new(zeros()?), Mutex::new(zeros()?)],
            device,
            params: RwLock::new(params),
            engine: Mutex::new(engine),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Accumulates `grad` into the active gradient.
    ///
    /// # Arguments
    /// * `active_idx` - The index of the active gradient, must be `0` or `1`.
    /// * `grad` - The gradient to accumulate to the active gradient.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `grad` isn't the same size as this shard.
    pub fn accumulate(&self, active_idx: usize, grad: &[f32]) -> Result<()> {
        self.check_len(grad.len())?;

        let grad = Buffer::from_f32(self.device.clone(), DType::Float32, grad)?;
        let mut active_grad = self.grads[active_idx].lock();
        active_grad.zip_apply(&grad, |acc, g| acc + g)?;
        Ok(())
    }

    /// Updates the parameters with the frozen gradient through the engine and clears it.
    ///
    /// The frozen gradient is cleared even if the update fails, a rejected step is dropped
    /// instead of being applied on a later swap.
    ///
    /// # Arguments
    /// * `frozen_idx` - The index of the frozen gradient, must be `0` or `1`.
    /// * `mb_size` - The size of the minibatch the gradient was accumulated over.
    pub fn update_params(&self, frozen_idx: usize, mb_size: Option<usize>) -> Result<()> {
        let mut params = self.params.write();
        let mut grad = self.grads[frozen_idx].lock();

        let result = self.engine.lock().update(&mut params, &mut grad, mb_size);

        grad.fill(0.);
        Ok(result?)
    }

    /// Copies the shard's parameters into the provided destination buffer.
    ///
    /// # Arguments
    /// * `out` - A mutable slice where the parameters will be copied.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `out` isn't the same size as this shard.
    pub fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        self.check_len(out.len())?;

        let params = self.params.read();
        out.copy_from_slice(&params.to_f32_vec());
        Ok(())
    }

    /// Copies the shard's smoothed parameters into `out`.
    ///
    /// # Returns
    /// `false` if the engine keeps no average yet.
    pub fn pull_averaged_params(&self, out: &mut [f32]) -> Result<bool> {
        self.check_len(out.len())?;

        let engine = self.engine.lock();
        let Some(avg) = engine.averaged_params() else {
            return Ok(false);
        };

        out.copy_from_slice(&avg.to_f32_vec());
        Ok(true)
    }

    pub fn observe(&self, event: TrainingEvent, state: &TrainingState) {
        self.engine.lock().observe(event, state);
    }

    /// Locks this shard's engine until the guard is dropped.
    pub fn lock_engine(&self) -> MutexGuard<'_, UpdateEngine> {
        self.engine.lock()
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.len {
            return Err(StoreErr::SizeMismatch {
                got,
                expected: self.len,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use optimizer::{CpuBackend, OptimizerConfig};

    use super::*;

    fn sgd() -> UpdateEngine {
        let config = OptimizerConfig {
            optimizer: "sgd".to_string(),
            learn_rate: 1.,
            clip_norm: 0.,
            ..Default::default()
        };

        UpdateEngine::from_config(&config).unwrap()
    }

    fn shard(values: &[f32]) -> ParameterShard {
        let params = Buffer::from_f32(CpuBackend::device(0), DType::Float32, values).unwrap();
        ParameterShard::new(params, sgd()).unwrap()
    }

    #[test]
    fn test_accumulation_and_update() {
        let shard = shard(&[0.; 3]);

        shard.accumulate(0, &[1.0, 2.0, 3.0]).unwrap();
        shard.accumulate(0, &[1.0, 1.0, 1.0]).unwrap();

        assert_eq!(shard.grads[0].lock().to_f32_vec(), vec![2., 3., 4.]);
        assert_eq!(shard.grads[1].lock().to_f32_vec(), vec![0., 0., 0.]);

        shard.update_params(0, None).unwrap();

        let mut out = [0.; 3];
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [-2., -3., -4.]);
        assert_eq!(shard.grads[0].lock().to_f32_vec(), vec![0., 0., 0.]);
    }

    #[test]
    fn test_double_buffering_flow() {
        let shard = shard(&[0.]);

        shard.accumulate(0, &[10.]).unwrap();
        shard.accumulate(1, &[5.]).unwrap();
        shard.update_params(0, None).unwrap();

        let mut out = [0.];
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [-10.]);

        shard.update_params(1, None).unwrap();
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [-15.]);
    }

    #[test]
    fn test_size_mismatch() {
        let shard = shard(&[0.; 2]);

        assert!(matches!(
            shard.accumulate(0, &[1.]),
            Err(StoreErr::SizeMismatch {
                got: 1,
                expected: 2
            })
        ));
        assert!(shard.pull_params(&mut [0.; 3]).is_err());
    }

    #[test]
    fn test_half_precision_shard() {
        let params = Buffer::from_f32(CpuBackend::device(0), DType::Float16, &[1., 2.]).unwrap();
        let shard = ParameterShard::new(params, sgd()).unwrap();

        shard.accumulate(0, &[0.5, 0.25]).unwrap();
        shard.update_params(0, None).unwrap();

        let mut out = [0.; 2];
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [0.5, 1.75]);
        assert!(shard.lock_engine().master_params().is_some());
    }

    #[test]
    fn test_failed_update_clears_frozen_gradient() {
        let config = OptimizerConfig {
            optimizer: "sgd".to_string(),
            learn_rate: 1.,
            clip_norm: 0.,
            mini_batch_words_ref: 32,
            ..Default::default()
        };
        let params = Buffer::from_f32(CpuBackend::device(0), DType::Float32, &[0.; 2]).unwrap();
        let shard =
            ParameterShard::new(params, UpdateEngine::from_config(&config).unwrap()).unwrap();

        shard.accumulate(0, &[1., 1.]).unwrap();
        assert!(matches!(
            shard.update_params(0, None),
            Err(StoreErr::Optimizer(_))
        ));
        assert_eq!(shard.grads[0].lock().to_f32_vec(), vec![0., 0.]);

        let mut out = [1.; 2];
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [0., 0.]);
    }
}
