pub mod alloc;
pub mod buffer;
pub mod checkpoint;
pub mod clip;
pub mod config;
pub mod device;
pub mod dtype;
mod engine;
pub mod error;
pub mod optimization;
pub mod persistence;
pub mod smoothing;
pub mod training;

pub use buffer::Buffer;
pub use config::{OptimizerConfig, RuleKind};
pub use device::{Backend, CpuBackend, Device};
pub use dtype::DType;
pub use engine::UpdateEngine;
pub use error::{OptimErr, Result};
pub use optimization::{Adagrad, Adam, Optimizer, Sgd, StepContext, UpdateRule};
pub use persistence::{GatherState, ScatterState, ShardLayout};
pub use training::{TrainingEvent, TrainingState};
