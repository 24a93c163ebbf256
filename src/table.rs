//! The seam to the external sorted-table format.
//!
//! The on-disk table layout, its parser, and the key comparator all live
//! outside this crate. The handle cache consumes them through these traits:
//! "open table file X of size S, get back a handle supporting point lookup
//! and Seek/Next/Prev iteration".

use std::path::Path;

use bytes::Bytes;

use crate::Result;

/// Opens table files on behalf of the handle cache.
pub trait TableOpener: Send + Sync {
    /// Open the table file with the given number and size.
    ///
    /// `path` follows the database's naming convention
    /// (see [`table_file_path`](crate::table_file_path)). The corresponding
    /// file length must be exactly `file_size` bytes.
    fn open(&self, path: &Path, file_number: u64, file_size: u64) -> Result<Box<dyn Table>>;
}

/// An opened, ready-to-query table file.
pub trait Table: Send + Sync {
    /// Point lookup: seek internally for `key` and return the matching
    /// entry's key and value, or `None` if the table holds no match.
    ///
    /// What counts as a match is the table's concern (the comparator lives
    /// with the table format, not here).
    fn get(&self, key: &[u8]) -> Result<Option<(Bytes, Bytes)>>;

    /// Create an iterator over the table's records.
    ///
    /// The iterator must be self-contained: implementations share whatever
    /// internal state they need (e.g. via `Arc`) rather than borrowing from
    /// `self`.
    fn iter(&self) -> Box<dyn TableIter>;
}

/// Iterator over a single table's records.
///
/// `key`/`value` are only meaningful while `valid()` returns true.
pub trait TableIter: Send {
    /// Whether the iterator is positioned at a record.
    fn valid(&self) -> bool;

    /// Position at the first record with key >= `target`.
    fn seek(&mut self, target: &[u8]);

    /// Position at the first record.
    fn seek_to_first(&mut self);

    /// Position at the last record.
    fn seek_to_last(&mut self);

    /// Advance to the next record.
    fn next(&mut self);

    /// Step back to the previous record.
    fn prev(&mut self);

    /// The current record's key.
    fn key(&self) -> &[u8];

    /// The current record's value.
    fn value(&self) -> &[u8];

    /// I/O status of the iteration.
    fn status(&self) -> Result<()> {
        Ok(())
    }
}
