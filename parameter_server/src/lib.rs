mod storage;

pub use storage::{ParameterStore, Result, StoreErr};
