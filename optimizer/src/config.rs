use std::{
    fmt::{self, Display},
    fs,
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    dtype::DType,
    error::{OptimErr, Result},
};

/// The update rules an engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Sgd,
    Adagrad,
    Adam,
}

impl FromStr for RuleKind {
    type Err = OptimErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sgd" => Ok(RuleKind::Sgd),
            "adagrad" => Ok(RuleKind::Adagrad),
            "adam" => Ok(RuleKind::Adam),
            other => Err(OptimErr::UnknownRule(other.to_string())),
        }
    }
}

impl Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleKind::Sgd => "sgd",
            RuleKind::Adagrad => "adagrad",
            RuleKind::Adam => "adam",
        };

        f.write_str(s)
    }
}

/// The configuration of an `UpdateEngine`.
///
/// The rule name is kept as a plain string so that an unknown name surfaces as
/// `OptimErr::UnknownRule` when the engine is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// One of `sgd`, `adagrad` or `adam`.
    pub optimizer: String,
    /// Positional hyper-parameters: `[eps]` for adagrad, `[beta1, beta2, eps, weight_decay]` for adam.
    pub optimizer_params: Vec<f32>,
    pub learn_rate: f32,
    /// Gradients are clipped to this L2 norm, `0` disables clipping.
    pub clip_norm: f32,
    /// The factor gradients were scaled by upstream.
    pub cost_scaling: f32,
    /// The minibatch size hyper-parameters were tuned for, `0` disables the adjustment.
    pub mini_batch_words_ref: usize,
    /// Weight of the newest parameters in the parameter average, `0` disables averaging.
    pub exponential_smoothing: f32,
    /// The element type the update rule computes in.
    pub optimizer_type: DType,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer: RuleKind::Adam.to_string(),
            optimizer_params: Vec::new(),
            learn_rate: 1e-4,
            clip_norm: 1.,
            cost_scaling: 1.,
            mini_batch_words_ref: 0,
            exponential_smoothing: 0.,
            optimizer_type: DType::Float32,
        }
    }
}

impl OptimizerConfig {
    /// Parses a JSON configuration, missing keys take their default value.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Reads a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Resolves the configured rule name.
    pub fn rule_kind(&self) -> Result<RuleKind> {
        self.optimizer.parse()
    }
}
