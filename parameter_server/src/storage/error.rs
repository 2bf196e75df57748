use std::{
    error::Error,
    fmt::{self, Display},
};

use optimizer::OptimErr;

/// The specific result type for the storage module.
pub type Result<T> = std::result::Result<T, StoreErr>;

/// Error returned by the `ParameterStore` and its shards.
#[derive(Debug)]
pub enum StoreErr {
    /// An external buffer's length doesn't match the store or shard size.
    SizeMismatch { got: usize, expected: usize },
    /// The shard's update engine failed.
    Optimizer(OptimErr),
}

impl Display for StoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErr::SizeMismatch { got, expected } => write!(
                f,
                "ParameterStore error: the provided buffer has length {got} but the store holds {expected} parameters"
            ),
            StoreErr::Optimizer(e) => write!(f, "ParameterStore error: {e}"),
        }
    }
}

impl Error for StoreErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreErr::Optimizer(e) => Some(e),
            StoreErr::SizeMismatch { .. } => None,
        }
    }
}

impl From<OptimErr> for StoreErr {
    fn from(value: OptimErr) -> Self {
        Self::Optimizer(value)
    }
}
