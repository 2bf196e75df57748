mod error;
mod shard;
mod store;

pub use error::{Result, StoreErr};
pub(super) use shard::ParameterShard;
pub use store::ParameterStore;
