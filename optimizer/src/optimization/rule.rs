use std::path::Path;

use super::{Adagrad, Adam, Optimizer, Sgd, StepContext};
use crate::{
    buffer::Buffer,
    config::{OptimizerConfig, RuleKind},
    device::Device,
    error::{OptimErr, Result},
    persistence::{GatherState, ScatterState},
};

/// The update rules an engine can run.
#[derive(Debug)]
pub enum UpdateRule {
    Sgd(Sgd),
    Adagrad(Adagrad),
    Adam(Adam),
}

impl UpdateRule {
    /// Creates a rule of the given kind with its default hyper-parameters.
    pub fn new(kind: RuleKind) -> Self {
        match kind {
            RuleKind::Sgd => UpdateRule::Sgd(Sgd::new()),
            RuleKind::Adagrad => UpdateRule::Adagrad(Adagrad::new()),
            RuleKind::Adam => UpdateRule::Adam(Adam::new()),
        }
    }

    /// Creates the configured rule and applies its positional hyper-parameters.
    ///
    /// # Returns
    /// An `UnknownRule` error if the configured name isn't a known rule.
    pub fn from_config(config: &OptimizerConfig) -> Result<Self> {
        let mut rule = Self::new(config.rule_kind()?);

        if !config.optimizer_params.is_empty() {
            rule.set_params(&config.optimizer_params);
        }

        Ok(rule)
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            UpdateRule::Sgd(_) => RuleKind::Sgd,
            UpdateRule::Adagrad(_) => RuleKind::Adagrad,
            UpdateRule::Adam(_) => RuleKind::Adam,
        }
    }

    pub fn as_adagrad(&self) -> Result<&Adagrad> {
        match self {
            UpdateRule::Adagrad(adagrad) => Ok(adagrad),
            other => Err(other.mismatch("adagrad")),
        }
    }

    pub fn as_adagrad_mut(&mut self) -> Result<&mut Adagrad> {
        match self {
            UpdateRule::Adagrad(adagrad) => Ok(adagrad),
            other => Err(other.mismatch("adagrad")),
        }
    }

    pub fn as_adam(&self) -> Result<&Adam> {
        match self {
            UpdateRule::Adam(adam) => Ok(adam),
            other => Err(other.mismatch("adam")),
        }
    }

    pub fn as_adam_mut(&mut self) -> Result<&mut Adam> {
        match self {
            UpdateRule::Adam(adam) => Ok(adam),
            other => Err(other.mismatch("adam")),
        }
    }

    fn mismatch(&self, expected: &'static str) -> OptimErr {
        OptimErr::RuleMismatch {
            expected,
            got: self.name(),
        }
    }

    /// Saves the state of every shard's rule to `path`.
    ///
    /// The first rule decides the variant, every other rule must be of the same kind. SGD has
    /// no state and writes nothing.
    ///
    /// # Arguments
    /// * `path` - The checkpoint file.
    /// * `rules` - The rule of every local shard, in shard order.
    /// * `gather` - Concatenates the per-shard state.
    /// * `is_main` - Only the main process writes.
    pub fn save<P: AsRef<Path>>(
        path: P,
        rules: &[&UpdateRule],
        gather: &dyn GatherState,
        is_main: bool,
    ) -> Result<()> {
        let Some(first) = rules.first() else {
            return Ok(());
        };

        match first.kind() {
            RuleKind::Sgd => Ok(()),
            RuleKind::Adagrad => {
                let opts = rules
                    .iter()
                    .map(|rule| rule.as_adagrad())
                    .collect::<Result<Vec<_>>>()?;

                Adagrad::save(path, &opts, gather, is_main)
            }
            RuleKind::Adam => {
                let opts = rules
                    .iter()
                    .map(|rule| rule.as_adam())
                    .collect::<Result<Vec<_>>>()?;

                Adam::save(path, &opts, gather, is_main)
            }
        }
    }

    /// Restores the state of every shard's rule from `path`.
    ///
    /// # Arguments
    /// * `path` - The checkpoint file.
    /// * `rules` - The rule of every local shard, in shard order.
    /// * `backends` - The device of every local shard, in shard order.
    /// * `scatter` - Splits the global state into per-shard ranges.
    pub fn load<P: AsRef<Path>>(
        path: P,
        rules: &mut [&mut UpdateRule],
        backends: &[Device],
        scatter: &dyn ScatterState,
    ) -> Result<()> {
        if rules.len() != backends.len() {
            return Err(OptimErr::ShardCountMismatch {
                rules: rules.len(),
                backends: backends.len(),
            });
        }

        let Some(kind) = rules.first().map(|rule| rule.kind()) else {
            return Ok(());
        };

        match kind {
            RuleKind::Sgd => Ok(()),
            RuleKind::Adagrad => {
                let mut opts = rules
                    .iter_mut()
                    .map(|rule| rule.as_adagrad_mut())
                    .collect::<Result<Vec<_>>>()?;

                Adagrad::load(path, &mut opts, backends, scatter)
            }
            RuleKind::Adam => {
                let mut opts = rules
                    .iter_mut()
                    .map(|rule| rule.as_adam_mut())
                    .collect::<Result<Vec<_>>>()?;

                Adam::load(path, &mut opts, backends, scatter)
            }
        }
    }
}

impl Optimizer for UpdateRule {
    fn name(&self) -> &'static str {
        match self {
            UpdateRule::Sgd(sgd) => sgd.name(),
            UpdateRule::Adagrad(adagrad) => adagrad.name(),
            UpdateRule::Adam(adam) => adam.name(),
        }
    }

    fn step(&mut self, params: &mut Buffer, grads: &Buffer, ctx: StepContext) -> Result<()> {
        match self {
            UpdateRule::Sgd(sgd) => sgd.step(params, grads, ctx),
            UpdateRule::Adagrad(adagrad) => adagrad.step(params, grads, ctx),
            UpdateRule::Adam(adam) => adam.step(params, grads, ctx),
        }
    }

    fn supports_rescaling(&self) -> bool {
        match self {
            UpdateRule::Sgd(sgd) => sgd.supports_rescaling(),
            UpdateRule::Adagrad(adagrad) => adagrad.supports_rescaling(),
            UpdateRule::Adam(adam) => adam.supports_rescaling(),
        }
    }

    fn reset_stats(&mut self) {
        match self {
            UpdateRule::Sgd(sgd) => sgd.reset_stats(),
            UpdateRule::Adagrad(adagrad) => adagrad.reset_stats(),
            UpdateRule::Adam(adam) => adam.reset_stats(),
        }
    }

    fn set_params(&mut self, params: &[f32]) {
        match self {
            UpdateRule::Sgd(sgd) => sgd.set_params(params),
            UpdateRule::Adagrad(adagrad) => adagrad.set_params(params),
            UpdateRule::Adam(adam) => adam.set_params(params),
        }
    }
}
