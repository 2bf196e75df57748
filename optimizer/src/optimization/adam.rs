use std::path::Path;

use log::{debug, info, warn};

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

/// First and second moment estimates, allocated together.
#[derive(Debug)]
struct Moments {
    mt: Buffer,
    vt: Buffer,
}

/// Adam, <https://arxiv.org/pdf/1412.6980v8.pdf>, with decoupled weight decay.
///
/// Gradients are treated as sums over the minibatch: the moments are fed the per-unit average
/// and the learning rate grows with the minibatch, relative to the reference size. Bias
/// correction is done with the running denominators `denom1` and `denom2`, which converge to
/// `1 - beta^t`.
#[derive(Debug)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    denom1: f64,
    denom2: f64,
    alloc: Option<BufferAllocator>,
    moments: Option<Moments>,
}

impl Default for Adam {
    fn default() -> Self {
        Self::new()
    }
}

impl Adam {
    /// The checkpoint item holding the first moment.
    pub const MT_ITEM: &'static str = "adam_mt";
    /// The checkpoint item holding the second moment.
    pub const VT_ITEM: &'static str = "adam_vt";
    /// The checkpoint item holding `[denom1, denom2]`.
    pub const DENOMS_ITEM: &'static str = "adam_denoms";

    /// Creates a new `Adam` optimizer with `beta1 = 0.9`, `beta2 = 0.999`, `eps = 1e-8` and no
    /// weight decay.
    pub fn new() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.,
            denom1: 0.,
            denom2: 0.,
            alloc: None,
            moments: None,
        }
    }

    pub fn beta1(&self) -> f32 {
        self.beta1
    }

    pub fn beta2(&self) -> f32 {
        self.beta2
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    pub fn weight_decay(&self) -> f32 {
        self.weight_decay
    }

    /// The bias correction denominators `(denom1, denom2)`.
    pub fn denoms(&self) -> (f64, f64) {
        (self.denom1, self.denom2)
    }

    /// The first moment, `None` until the first update or load.
    pub fn mt(&self) -> Option<&Buffer> {
        self.moments.as_ref().map(|m| &m.mt)
    }

    /// The second moment, `None` until the first update or load.
    pub fn vt(&self) -> Option<&Buffer> {
        self.moments.as_ref().map(|m| &m.vt)
    }

    /// Returns both moments, allocating them zeroed if needed.
    ///
    /// # Arguments
    /// * `device` - The device backing the shard.
    /// * `len` - The amount of parameters in the shard.
    /// * `dtype` - The element type of the moments.
    fn state(&mut self, device: &Device, len: usize, dtype: DType) -> Result<&mut Moments> {
        let moments = match self.moments.take() {
            Some(moments) => moments,
            None => {
                let alloc = self
                    .alloc
                    .get_or_insert_with(|| BufferAllocator::new(device.clone()));
                alloc.reserve_exact(2 * len * dtype.size());

                Moments {
                    mt: alloc.allocate(len, dtype)?,
                    vt: alloc.allocate(len, dtype)?,
                }
            }
        };

        Ok(self.moments.insert(moments))
    }

    /// Gathers both moments from every shard and writes them, along with the denominators, to
    /// `path`.
    ///
    /// The denominators are identical on every shard, the first one's are written.
    ///
    /// # Arguments
    /// * `path` - The checkpoint file.
    /// * `opts` - The optimizer of every local shard, in shard order.
    /// * `gather` - Concatenates the per-shard state.
    /// * `is_main` - Only the main process writes, the others gather and discard.
    pub fn save<P: AsRef<Path>>(
        path: P,
        opts: &[&Adam],
        gather: &dyn GatherState,
        is_main: bool,
    ) -> Result<()> {
        let path = path.as_ref();

        let Some(first) = opts.first() else {
            return Ok(());
        };

        if opts.iter().any(|opt| opt.moments.is_none()) {
            warn!("Adam state not allocated yet, nothing to save");
            return Ok(());
        }

        if is_main {
            info!("saving Adam state to {}", path.display());
        }

        let mt = gather.gather(&mut |i| {
            let opt = shard_at(opts, i)?;
            Ok(opt.mt().map(Buffer::to_f32_vec).unwrap_or_default())
        })?;

        let vt = gather.gather(&mut |i| {
            let opt = shard_at(opts, i)?;
            Ok(opt.vt().map(Buffer::to_f32_vec).unwrap_or_default())
        })?;

        if !is_main {
            return Ok(());
        }

        let (denom1, denom2) = first.denoms();
        let items = [
            Item::from_f32(Self::MT_ITEM, &mt),
            Item::from_f32(Self::VT_ITEM, &vt),
            Item::from_f64(Self::DENOMS_ITEM, &[denom1, denom2]),
        ];

        checkpoint::save_items(path, &items)
    }

    /// Reads both moments and the denominators from `path` and scatters them across the shards.
    ///
    /// A missing file or a file without moments leaves the state untouched. A file without
    /// denominators loads them as `0`.
    ///
    /// # Arguments
    /// * `path` - The checkpoint file.
    /// * `opts` - The optimizer of every local shard, in shard order.
    /// * `backends` - The device of every local shard, in shard order.
    /// * `scatter` - Splits the global state into per-shard ranges.
    pub fn load<P: AsRef<Path>>(
        path: P,
        opts: &mut [&mut Adam],
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

        info!("loading Adam state from {}", path.display());

        let (mut mt, mut vt) = (Vec::new(), Vec::new());
        let mut denoms = [0.; 2];

        for item in checkpoint::load_items(path)? {
            match item.name.as_str() {
                Self::MT_ITEM => mt = item.to_f32_vec()?,
                Self::VT_ITEM => vt = item.to_f32_vec()?,
                Self::DENOMS_ITEM => {
                    let values = item.to_f64_vec()?;
                    denoms = values.try_into().map_err(|values: Vec<f64>| {
                        OptimErr::InvalidDenoms { got: values.len() }
                    })?;
                }
                other => debug!(item = other; "ignoring checkpoint item"),
            }
        }

        if mt.is_empty() || vt.is_empty() {
            warn!("Adam state not found in {}", path.display());
            return Ok(());
        }

        if mt.len() != vt.len() {
            return Err(OptimErr::SizeMismatch {
                a: Self::VT_ITEM,
                b: Self::MT_ITEM,
                got: vt.len(),
                expected: mt.len(),
            });
        }

        // Dry run, no shard is touched unless every shard accepts its range.
        scatter.scatter(&mt, &mut |i, range| {
            let opt = shard_at(opts, i)?;
            check_state_len(opt.mt(), range.len())
        })?;

        scatter.scatter(&mt, &mut |i, range| {
            let device = shard_at(backends, i)?;
            let opt = shard_at_mut(opts, i)?;
            opt.state(device, range.len(), DType::Float32)?
                .mt
                .set_f32(range)
        })?;

        scatter.scatter(&vt, &mut |i, range| {
            let device = shard_at(backends, i)?;
            let opt = shard_at_mut(opts, i)?;
            opt.state(device, range.len(), DType::Float32)?
                .vt
                .set_f32(range)
        })?;

        let [denom1, denom2] = denoms;
        for opt in opts.iter_mut() {
            opt.denom1 = denom1;
            opt.denom2 = denom2;
        }

        Ok(())
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn step(&mut self, params: &mut Buffer, grads: &Buffer, ctx: StepContext) -> Result<()> {
        check_grads(params, grads)?;

        if ctx.mb_size == 0 || ctx.ref_mb_words == 0 {
            return Err(OptimErr::InvalidMiniBatchSize);
        }

        let t = ctx.mb_size as f64;
        let t_ref = ctx.ref_mb_words as f64;

        let (beta1, beta2) = (self.beta1 as f64, self.beta2 as f64);
        let eta = (ctx.eta as f64 * (t / t_ref)) as f32;

        let denom1 = beta1 * self.denom1 + (1. - beta1);
        let denom2 = beta2 * self.denom2 + (1. - beta2);

        // Gradients are sums over the minibatch, dividing by T feeds the moments the average.
        let c1 = ((1. - beta1) / t) as f32;
        let c2 = ((1. - beta2) / t / t) as f32;
        let (b1, b2) = (self.beta1, self.beta2);
        let (eps, decay) = (self.eps, self.weight_decay);
        let (d1, d2) = (denom1 as f32, denom2 as f32);

        let Moments { mt, vt } = self.state(params.device(), params.len(), params.dtype())?;

        mt.zip_apply(grads, |m, g| b1 * m + c1 * g)?;
        vt.zip_apply(grads, |v, g| b2 * v + c2 * (g * g))?;
        params.zip_apply2(mt, vt, |p, m, v| {
            p - eta * ((m / d1) / ((v / d2).sqrt() + eps) + decay * p)
        })?;

        self.denom1 = denom1;
        self.denom2 = denom2;
        Ok(())
    }

    fn reset_stats(&mut self) {
        if let Some(Moments { mt, vt }) = self.moments.as_mut() {
            mt.fill(0.);
            vt.fill(0.);
        }

        self.denom1 = 0.;
        self.denom2 = 0.;
    }

    fn set_params(&mut self, params: &[f32]) {
        let fields = [
            &mut self.beta1,
            &mut self.beta2,
            &mut self.eps,
            &mut self.weight_decay,
        ];

        for (field, &value) in fields.into_iter().zip(params) {
            *field = value;
        }
    }
}
