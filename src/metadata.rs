//! File metadata for table files.

use bytes::Bytes;

/// Metadata about a table file: its size and key range.
///
/// Lives in the handle cache's side map with a lifecycle independent of the
/// cached handles: evicting a handle does not remove its metadata, and
/// removing metadata does not touch the handle cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Unique file number.
    file_number: u64,
    /// File size in bytes.
    file_size: u64,
    /// Smallest key in the file.
    smallest: Bytes,
    /// Largest key in the file.
    largest: Bytes,
}

impl FileMetadata {
    /// Create new file metadata.
    pub fn new(file_number: u64, file_size: u64, smallest: Bytes, largest: Bytes) -> Self {
        Self {
            file_number,
            file_size,
            smallest,
            largest,
        }
    }

    /// Get the file number.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Get the file size.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Get the smallest key.
    pub fn smallest(&self) -> &Bytes {
        &self.smallest
    }

    /// Get the largest key.
    pub fn largest(&self) -> &Bytes {
        &self.largest
    }

    /// Check if a key might be in this file's range (byte-wise order).
    pub fn may_contain_key(&self, key: &[u8]) -> bool {
        key >= self.smallest.as_ref() && key <= self.largest.as_ref()
    }

    /// Check if the file's key range overlaps with the given range.
    pub fn overlaps(&self, smallest: &[u8], largest: &[u8]) -> bool {
        self.largest.as_ref() >= smallest && self.smallest.as_ref() <= largest
    }
}
