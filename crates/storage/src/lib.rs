mod cache;
pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use cache::{CachedStore, TtlCache};
pub use error::StorageError;
pub use memory::{MemoryStorage, MemoryTxn};
pub use record::{LaneRecord, NewDeployment, NewRule, NewSnapshot, SubtaskRemap};
pub use traits::PolicyStorage;
