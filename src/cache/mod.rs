//! Caching of opened table handles.
//!
//! - **LRU Cache**: generic sharded cache with atomic get-or-create and
//!   reference-counted eviction
//! - **Table Handle Cache**: caches opened table file handles, with iterator
//!   decoration, a per-file metadata side map, and seek instrumentation

mod iterator;
mod lru;
mod table_cache;

pub use iterator::FileNumberIterator;
pub use lru::{CacheStats, LruCache};
pub use table_cache::{TableHandle, TableHandleCache};
