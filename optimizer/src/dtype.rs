use std::fmt::{self, Display};

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// The numeric element types understood by buffers and checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Float16,
    Bfloat16,
    Float32,
    Float64,
}

impl DType {
    /// Returns the size in bytes of a single element.
    pub fn size(self) -> usize {
        match self {
            DType::Float16 | DType::Bfloat16 => 2,
            DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }

    /// Returns the smallest positive normal value representable by this type.
    pub fn min_positive(self) -> f32 {
        match self {
            DType::Float16 => f16::MIN_POSITIVE.to_f32(),
            DType::Bfloat16 => bf16::MIN_POSITIVE.to_f32(),
            // f64's minimum underflows to zero in f32 arithmetic.
            DType::Float32 | DType::Float64 => f32::MIN_POSITIVE,
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Float16 => "float16",
            DType::Bfloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        };

        f.write_str(s)
    }
}

/// Scalar types that can be stored in a `Buffer`.
///
/// Element-wise kernels always evaluate in `f32`, narrower types are widened on read and
/// rounded on write.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f32(self) -> f32;

    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::Float32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::Float16;

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::Bfloat16;

    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}
