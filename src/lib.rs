//! # readcache
//!
//! Read-path caching for embedded LSM key-value storage engines.
//!
//! ## Components
//!
//! - **Location Cache**: a crash-consistent hash table mapping a key to the
//!   file number of the sorted-table file currently holding it, used as a
//!   fast-path shortcut past the version lookup
//! - **Table Handle Cache**: a bounded cache of opened table file handles
//!   with reference-counted eviction, per-file metadata bookkeeping, and
//!   per-worker seek-latency instrumentation
//!
//! The sorted-table format itself, compaction, and version management stay
//! outside: table files are consumed through the [`TableOpener`] /
//! [`Table`] / [`TableIter`] traits.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use readcache::{LocationCache, TableHandleCache};
//!
//! // Durable key -> file number shortcuts.
//! let locations = LocationCache::open_or_create("./db/kloc")?;
//! locations.insert(b"user:1", 42)?;
//! assert_eq!(locations.get(b"user:1"), Some(42));
//!
//! // Shared handles for opened table files.
//! let tables = TableHandleCache::new("./db", opener, 1000);
//! let timer = tables.register_seek_worker();
//! tables.get(42, file_size, b"user:1", |key, value| { /* found */ }, &timer)?;
//! ```

// Public modules
pub mod error;
pub mod options;

// Internal modules
mod cache;
mod location;
mod metadata;
mod metrics;
mod table;
mod util;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{
    LocationCacheOptions, DEFAULT_BUCKET_CAPACITY, DEFAULT_NBUCKETS, DEFAULT_POOL_SIZE,
    MAX_KEY_SIZE,
};

// Location cache
pub use location::{InsertOutcome, LocationCache, ReplaceOutcome};

// Handle cache
pub use cache::{CacheStats, FileNumberIterator, LruCache, TableHandle, TableHandleCache};

// File metadata
pub use metadata::FileMetadata;

// Seek instrumentation
pub use metrics::{SeekTimer, SeekTimerRegistry, SeekTimerSummary};

// Table format seam
pub use table::{Table, TableIter, TableOpener};

// Table file naming
pub use util::filename::{parse_table_file_name, table_file_path};
