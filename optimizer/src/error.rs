use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use crate::dtype::DType;

/// The result type used in the entire optimizer crate.
pub type Result<T> = std::result::Result<T, OptimErr>;

/// The optimizer crate's error type.
///
/// Every variant except the I/O ones is a precondition violation, it is returned before any
/// buffer or optimizer state is mutated.
#[derive(Debug)]
pub enum OptimErr {
    MissingMiniBatchSize,
    InvalidMiniBatchSize,
    MiniBatchRescaling {
        rule: &'static str,
        actual: usize,
        reference: usize,
    },
    SizeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
    DTypeMismatch {
        expected: DType,
        got: DType,
    },
    UnsupportedDType(DType),
    UnknownRule(String),
    InvalidDenoms {
        got: usize,
    },
    ShardCountMismatch {
        rules: usize,
        backends: usize,
    },
    RuleMismatch {
        expected: &'static str,
        got: &'static str,
    },
    AllocatorExhausted {
        requested: usize,
        available: usize,
    },
    Io(io::Error),
    Checkpoint(String),
    Config(String),
}

impl Display for OptimErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimErr::MissingMiniBatchSize => f.write_str(
                "a reference minibatch size is configured but the caller did not provide the minibatch size",
            ),
            OptimErr::InvalidMiniBatchSize => {
                f.write_str("the minibatch size must be a positive count")
            }
            OptimErr::MiniBatchRescaling {
                rule,
                actual,
                reference,
            } => write!(
                f,
                "{rule} does not support minibatch-size rescaling, got size {actual} with reference {reference}"
            ),
            OptimErr::SizeMismatch {
                a,
                b,
                got,
                expected,
            } => write!(
                f,
                "there's a size mismatch between {a} and {b}, got {got} and expected {expected}"
            ),
            OptimErr::DTypeMismatch { expected, got } => {
                write!(f, "dtype mismatch: expected {expected}, got {got}")
            }
            OptimErr::UnsupportedDType(dtype) => {
                write!(f, "buffers of dtype {dtype} are not supported")
            }
            OptimErr::UnknownRule(name) => write!(f, "unknown optimizer kind: {name}"),
            OptimErr::InvalidDenoms { got } => {
                write!(f, "adam_denoms should have 2 entries, got {got}")
            }
            OptimErr::ShardCountMismatch { rules, backends } => write!(
                f,
                "got {rules} optimizer shards but {backends} device backends"
            ),
            OptimErr::RuleMismatch { expected, got } => {
                write!(f, "expected a {expected} optimizer shard, got {got}")
            }
            OptimErr::AllocatorExhausted {
                requested,
                available,
            } => write!(
                f,
                "allocator exhausted: requested {requested} bytes with {available} bytes left in the reservation"
            ),
            OptimErr::Io(e) => write!(f, "io error: {e}"),
            OptimErr::Checkpoint(reason) => write!(f, "checkpoint error: {reason}"),
            OptimErr::Config(reason) => write!(f, "config error: {reason}"),
        }
    }
}

impl Error for OptimErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OptimErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OptimErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<safetensors::SafeTensorError> for OptimErr {
    fn from(value: safetensors::SafeTensorError) -> Self {
        Self::Checkpoint(value.to_string())
    }
}

impl From<serde_json::Error> for OptimErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}
