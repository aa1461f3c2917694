//! Versioned cache sets.
//!
//! Every stored response belongs to exactly one cache set, identified by a
//! version label such as `v2`. Sets are created on install, pruned on
//! activation, and grow by write-through while requests are intercepted.

mod keys;
mod lock;
mod store;

pub use keys::RequestKey;
pub use store::{
    CacheEntrySummary, CacheSetSummary, CacheStorage, MemoryCacheStorage, StorageError,
};
