use log::{info, trace};

use crate::{
    alloc::BufferAllocator,
    buffer::Buffer,
    clip::{Clipper, NormClipper},
    config::OptimizerConfig,
    dtype::DType,
    error::{OptimErr, Result},
    optimization::{Optimizer, StepContext, UpdateRule},
    smoothing::ExponentialSmoothing,
    training::{TrainingEvent, TrainingState},
};

/// The master parameter copy and the cast gradient, in the working type.
#[derive(Debug)]
struct Staging {
    pm: Buffer,
    gd: Buffer,
}

/// The buffers the rule reads and writes during one update.
///
/// Either the caller's own buffers, when the parameters are already in the working type, or the
/// engine's staging copies. In the latter case the caller's gradient is kept around as well,
/// clipping acts on it.
enum WorkingSet<'a> {
    Aliased {
        params: &'a mut Buffer,
        grads: &'a mut Buffer,
    },
    Master {
        staging: &'a mut Staging,
        grads: &'a mut Buffer,
    },
}

impl WorkingSet<'_> {
    fn params(&self) -> &Buffer {
        match self {
            WorkingSet::Aliased { params, .. } => params,
            WorkingSet::Master { staging, .. } => &staging.pm,
        }
    }

    fn grads_mut(&mut self) -> &mut Buffer {
        match self {
            WorkingSet::Aliased { grads, .. } => grads,
            WorkingSet::Master { staging, .. } => &mut staging.gd,
        }
    }

    /// The gradient as handed in by the caller, before any cast.
    fn original_grads_mut(&mut self) -> &mut Buffer {
        match self {
            WorkingSet::Aliased { grads, .. } | WorkingSet::Master { grads, .. } => grads,
        }
    }

    fn parts(&mut self) -> (&mut Buffer, &Buffer) {
        match self {
            WorkingSet::Aliased { params, grads } => (&mut **params, &**grads),
            WorkingSet::Master { staging, .. } => (&mut staging.pm, &staging.gd),
        }
    }
}

/// Runs the shared pre and post processing around an `UpdateRule` for one parameter shard.
///
/// Each update optionally moves the parameters into the working type, undoes cost scaling,
/// clips the gradient, steps the rule, updates the parameter average and writes the result back
/// into the caller's parameters.
#[derive(Debug)]
pub struct UpdateEngine {
    rule: UpdateRule,
    eta: f32,
    ref_mb_words: usize,
    cost_scale: f32,
    batches_seen: usize,
    clipper: Option<Box<dyn Clipper>>,
    smoothing: Option<ExponentialSmoothing>,
    working_type: DType,
    alloc: Option<BufferAllocator>,
    avg: Option<Buffer>,
    staging: Option<Staging>,
}

impl UpdateEngine {
    /// Creates a new `UpdateEngine` running the configured rule.
    ///
    /// # Returns
    /// An `UnknownRule` error if the configured rule name isn't known.
    pub fn from_config(config: &OptimizerConfig) -> Result<Self> {
        let rule = UpdateRule::from_config(config)?;
        Ok(Self::with_rule(rule, config))
    }

    /// Creates a new `UpdateEngine` around an already built rule.
    ///
    /// # Arguments
    /// * `rule` - The update rule to run.
    /// * `config` - Every other setting of the engine, the rule name is ignored.
    ///
    /// # Returns
    /// A new `UpdateEngine` instance.
    pub fn with_rule(rule: UpdateRule, config: &OptimizerConfig) -> Self {
        let clipper = (config.clip_norm > 0.)
            .then(|| Box::new(NormClipper::new(config.clip_norm)) as Box<dyn Clipper>);

        if config.mini_batch_words_ref != 0 {
            info!(
                "learning rate gets adjusted as if minibatch size was {}",
                config.mini_batch_words_ref
            );
        }

        Self {
            rule,
            eta: config.learn_rate,
            ref_mb_words: config.mini_batch_words_ref,
            cost_scale: config.cost_scaling,
            batches_seen: 0,
            clipper,
            smoothing: ExponentialSmoothing::new(
                config.exponential_smoothing,
                config.mini_batch_words_ref,
            ),
            working_type: config.optimizer_type,
            alloc: None,
            avg: None,
            staging: None,
        }
    }

    /// Replaces the gradient clipper, `None` disables clipping.
    pub fn set_clipper(&mut self, clipper: Option<Box<dyn Clipper>>) {
        self.clipper = clipper;
    }

    /// Performs one optimization step.
    ///
    /// # Arguments
    /// * `params` - The parameters of the shard, updated in place.
    /// * `grads` - The gradient of the shard, used as scratch space: cost scaling is undone and
    ///   clipping is applied in place.
    /// * `mb_size` - The size of the minibatch the gradient was computed on. Required when a
    ///   reference minibatch size is configured, ignored otherwise.
    ///
    /// # Returns
    /// An error if a precondition doesn't hold. Neither the parameters nor the rule state are
    /// modified in that case.
    pub fn update(
        &mut self,
        params: &mut Buffer,
        grads: &mut Buffer,
        mb_size: Option<usize>,
    ) -> Result<()> {
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

        let (mb_size, ref_mb_words) = match self.ref_mb_words {
            0 => (1, 1),
            reference => (mb_size.ok_or(OptimErr::MissingMiniBatchSize)?, reference),
        };

        if mb_size == 0 {
            return Err(OptimErr::InvalidMiniBatchSize);
        }

        if mb_size != ref_mb_words && !self.rule.supports_rescaling() {
            return Err(OptimErr::MiniBatchRescaling {
                rule: self.rule.name(),
                actual: mb_size,
                reference: ref_mb_words,
            });
        }

        let cast = params.dtype() != self.working_type;
        let elements = params.len();
        let bytes = elements * self.working_type.size();

        trace!(elements = elements, cast = cast; "optimizer update");

        if self.smoothing.is_some() && self.avg.is_none() {
            let alloc = self
                .alloc
                .get_or_insert_with(|| BufferAllocator::new(params.device().clone()));

            // Room for the master copy and the cast gradient as well.
            let shards = if cast { 3 } else { 1 };
            alloc.reserve_exact(shards * bytes);
            self.avg = Some(alloc.allocate(elements, self.working_type)?);
        }

        let mut working = if cast {
            let alloc = self.alloc.get_or_insert_with(|| {
                let mut alloc = BufferAllocator::new(params.device().clone());
                alloc.reserve_exact(2 * bytes);
                alloc
            });

            let staging = match self.staging.take() {
                Some(staging) => staging,
                None => {
                    let mut pm = alloc.allocate(elements, self.working_type)?;
                    let gd = alloc.allocate(elements, self.working_type)?;

                    pm.copy_cast_from(params)?;
                    Staging { pm, gd }
                }
            };

            let staging = self.staging.insert(staging);
            staging.gd.copy_cast_from(grads)?;

            WorkingSet::Master {
                staging,
                grads: &mut *grads,
            }
        } else {
            WorkingSet::Aliased {
                params: &mut *params,
                grads: &mut *grads,
            }
        };

        if self.cost_scale != 1. {
            let cost_scale = self.cost_scale;
            working.grads_mut().map_inplace(|g| g / cost_scale);
        }

        if let Some(clipper) = &self.clipper {
            clipper.clip(working.original_grads_mut());
        }

        let ctx = StepContext {
            eta: self.eta,
            mb_size,
            ref_mb_words,
        };

        let (pm, gd) = working.parts();
        self.rule.step(pm, gd, ctx)?;

        if let (Some(smoothing), Some(avg)) = (&self.smoothing, self.avg.as_mut()) {
            smoothing.update_avg_params(avg, working.params(), self.batches_seen, mb_size)?;
        }

        if let Some(staging) = self.staging.as_ref().filter(|_| cast) {
            params.copy_cast_from(&staging.pm)?;
        }

        params.device().synchronize();
        Ok(())
    }

    /// Applies a training loop event.
    ///
    /// Every event sets the learning rate, `AfterBatches` records the batch count and the epoch,
    /// batches and stalled events reset the rule's statistics when requested.
    pub fn observe(&mut self, event: TrainingEvent, state: &TrainingState) {
        let batches = event.carries_batches().then_some(state.batches);
        let reset = event.may_reset() && state.reset;

        self.apply_training_signal(state.eta, batches, reset);
    }

    /// Pushes the training loop's state into the engine.
    ///
    /// # Arguments
    /// * `eta` - The new learning rate.
    /// * `batches` - The cumulative batch count, if known.
    /// * `reset` - Zeroes the rule's statistics.
    pub fn apply_training_signal(&mut self, eta: f32, batches: Option<usize>, reset: bool) {
        self.eta = eta;

        if let Some(batches) = batches {
            self.batches_seen = batches;
        }

        if reset {
            info!("resetting {} statistics", self.rule.name());
            self.rule.reset_stats();
        }
    }

    /// The exponentially smoothed parameters, `None` when smoothing is disabled or before the
    /// first update.
    pub fn averaged_params(&self) -> Option<&Buffer> {
        self.avg.as_ref()
    }

    /// The working type copy of the parameters, `None` unless the parameters are cast.
    pub fn master_params(&self) -> Option<&Buffer> {
        self.staging.as_ref().map(|staging| &staging.pm)
    }

    pub fn learning_rate(&self) -> f32 {
        self.eta
    }

    pub fn batches_seen(&self) -> usize {
        self.batches_seen
    }

    pub fn working_type(&self) -> DType {
        self.working_type
    }

    pub fn rule(&self) -> &UpdateRule {
        &self.rule
    }

    pub fn rule_mut(&mut self) -> &mut UpdateRule {
        &mut self.rule
    }

    /// The engine's own allocator, holding the average and the staging buffers.
    pub fn allocator(&self) -> Option<&BufferAllocator> {
        self.alloc.as_ref()
    }
}
