//! Cache of opened table file handles.
//!
//! Opening a table file means parsing its index structures and holding file
//! descriptors; this cache amortizes that cost across reads. Handles are
//! shared through `Arc`: eviction unpins a handle from the cache, and the
//! table actually closes when the last iterator or lookup referencing it is
//! done.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::metadata::FileMetadata;
use crate::metrics::{SeekTimer, SeekTimerRegistry};
use crate::table::{Table, TableOpener};
use crate::util::filename::table_file_path;
use crate::Result;

use super::iterator::FileNumberIterator;
use super::lru::{CacheStats, LruCache};

/// One opened table file, shared between the cache and any live consumers.
pub struct TableHandle {
    file_number: u64,
    file_size: u64,
    table: Box<dyn Table>,
}

impl TableHandle {
    /// Get the file number.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Get the file size.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Access the opened table.
    pub fn table(&self) -> &dyn Table {
        self.table.as_ref()
    }
}

/// Bounded cache of opened table handles, keyed by file number.
pub struct TableHandleCache {
    /// Database directory the table files live in.
    db_path: PathBuf,
    /// The external "open table file" collaborator.
    opener: Arc<dyn TableOpener>,
    cache: LruCache<u64, Arc<TableHandle>>,
    /// Side map of per-file metadata, with a lifecycle independent of the
    /// handle cache: callers insert and remove entries explicitly.
    file_metadata: Mutex<HashMap<u64, FileMetadata>>,
    seek_timers: SeekTimerRegistry,
}

impl TableHandleCache {
    /// Create a cache for the database at `db_path`, opening files through
    /// `opener` and keeping at most `capacity` handles.
    pub fn new(db_path: impl AsRef<Path>, opener: Arc<dyn TableOpener>, capacity: usize) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            opener,
            cache: LruCache::new(capacity),
            file_metadata: Mutex::new(HashMap::new()),
            seek_timers: SeekTimerRegistry::new(),
        }
    }

    /// Find the cached handle for a file, opening it on a miss.
    ///
    /// Concurrent misses for one file perform exactly one physical open. A
    /// failed open is not cached.
    fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<TableHandle>> {
        self.cache.get_or_try_insert_with(file_number, || {
            let path = table_file_path(&self.db_path, file_number);
            let table = self.opener.open(&path, file_number, file_size)?;
            tracing::debug!(file_number, file_size, "opened table file");
            Ok(Arc::new(TableHandle {
                file_number,
                file_size,
                table,
            }))
        })
    }

    /// Return an iterator over the given file's records.
    ///
    /// The iterator pins the cached handle, so evicting the file while the
    /// iterator is alive does not invalidate it.
    pub fn new_iterator(&self, file_number: u64, file_size: u64) -> Result<FileNumberIterator> {
        let handle = self.find_table(file_number, file_size)?;
        let iter = handle.table().iter();
        Ok(FileNumberIterator::with_handle(iter, file_number, Some(handle)))
    }

    /// Point lookup in the given file.
    ///
    /// Seeks for `key` and, if the table holds a matching entry, calls
    /// `on_found(found_key, found_value)` exactly once and returns
    /// `Ok(true)`. `Ok(false)` means the key is absent — that is not an
    /// error. `Err` means the open or the read failed.
    ///
    /// The wall-clock cost of the seek is recorded into `timer`, the
    /// accumulator belonging to the calling worker.
    pub fn get<F>(
        &self,
        file_number: u64,
        file_size: u64,
        key: &[u8],
        mut on_found: F,
        timer: &SeekTimer,
    ) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let handle = self.find_table(file_number, file_size)?;

        let start = Instant::now();
        let found = handle.table().get(key);
        timer.record(start.elapsed());

        match found? {
            Some((found_key, found_value)) => {
                on_found(&found_key, &found_value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop the cache entry for a file, e.g. once compaction deleted it.
    ///
    /// Live references (open iterators) keep the underlying table open
    /// until they are dropped; a later request for the same file number
    /// opens it fresh.
    pub fn evict(&self, file_number: u64) {
        if self.cache.remove(&file_number).is_some() {
            tracing::debug!(file_number, "evicted table handle");
        }
    }

    /// Record metadata for a file. A second call for the same file number
    /// replaces the earlier entry.
    pub fn set_file_metadata(
        &self,
        file_number: u64,
        file_size: u64,
        smallest: Bytes,
        largest: Bytes,
    ) {
        self.file_metadata.lock().insert(
            file_number,
            FileMetadata::new(file_number, file_size, smallest, largest),
        );
    }

    /// Look up the metadata recorded for a file.
    pub fn file_metadata(&self, file_number: u64) -> Option<FileMetadata> {
        self.file_metadata.lock().get(&file_number).cloned()
    }

    /// Remove the metadata recorded for a file. The handle cache itself is
    /// untouched.
    pub fn remove_file_metadata(&self, file_number: u64) {
        self.file_metadata.lock().remove(&file_number);
    }

    /// Register a seek worker, getting back its private timer.
    pub fn register_seek_worker(&self) -> Arc<SeekTimer> {
        self.seek_timers.register_worker()
    }

    /// Cumulative seek latency report across all workers.
    pub fn seek_report_cumulative(&self) -> String {
        self.seek_timers.cumulative_report()
    }

    /// Per-worker seek latency report.
    pub fn seek_report_individual(&self) -> String {
        self.seek_timers.individual_reports()
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if no handles are cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Get handle cache statistics.
    pub fn stats(&self) -> Arc<CacheStats> {
        self.cache.stats()
    }
}
