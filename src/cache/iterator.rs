//! Iterator decorator that remembers its originating file.

use crate::table::TableIter;
use crate::Result;

use super::table_cache::TableHandle;
use std::sync::Arc;

/// A table iterator that knows which file number it came from.
///
/// Wraps the underlying iterator and caches its validity: every positioning
/// call delegates, then re-derives the flag from the underlying iterator.
/// [`make_invalid`](Self::make_invalid) forces the flag off without
/// consulting the underlying iterator, which a k-way merge uses to mark a
/// source as exhausted from its own point of view.
///
/// `key`/`value`/`file_number` must only be called while `valid()` returns
/// true; debug builds assert this.
///
/// The iterator may hold a reference to the cache entry it came from, so an
/// eviction of that file cannot close the table out from under it.
pub struct FileNumberIterator {
    iter: Box<dyn TableIter>,
    file_number: u64,
    valid: bool,
    handle: Option<Arc<TableHandle>>,
}

impl FileNumberIterator {
    /// Wrap `iter`, tagging it with `file_number`.
    pub fn new(iter: Box<dyn TableIter>, file_number: u64) -> Self {
        Self::with_handle(iter, file_number, None)
    }

    /// Wrap `iter`, additionally pinning the cache entry it came from for
    /// the iterator's lifetime.
    pub(crate) fn with_handle(
        iter: Box<dyn TableIter>,
        file_number: u64,
        handle: Option<Arc<TableHandle>>,
    ) -> Self {
        let mut it = Self {
            iter,
            file_number,
            valid: false,
            handle,
        };
        it.update();
        it
    }

    /// Replace the wrapped iterator. The previous one is dropped and
    /// validity is re-derived from the new one.
    pub fn set(&mut self, iter: Box<dyn TableIter>) {
        self.iter = iter;
        self.update();
    }

    /// The file number this iterator reads from.
    pub fn file_number(&self) -> u64 {
        debug_assert!(self.valid);
        self.file_number
    }

    /// Force the iterator invalid without touching the underlying iterator.
    pub fn make_invalid(&mut self) {
        self.valid = false;
    }

    /// The cache handle pinned by this iterator, if any.
    pub fn handle(&self) -> Option<&Arc<TableHandle>> {
        self.handle.as_ref()
    }

    fn update(&mut self) {
        self.valid = self.iter.valid();
    }
}

impl TableIter for FileNumberIterator {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek(&mut self, target: &[u8]) {
        self.iter.seek(target);
        self.update();
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
        self.update();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
        self.update();
    }

    fn next(&mut self) {
        self.iter.next();
        self.update();
    }

    fn prev(&mut self) {
        self.iter.prev();
        self.update();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.iter.value()
    }

    fn status(&self) -> Result<()> {
        self.iter.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory iterator over sorted entries.
    struct VecIter {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
    }

    impl VecIter {
        fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            Self { entries, pos: None }
        }
    }

    impl TableIter for VecIter {
        fn valid(&self) -> bool {
            self.pos.is_some()
        }

        fn seek(&mut self, target: &[u8]) {
            let idx = self.entries.partition_point(|(k, _)| k.as_slice() < target);
            self.pos = (idx < self.entries.len()).then_some(idx);
        }

        fn seek_to_first(&mut self) {
            self.pos = (!self.entries.is_empty()).then_some(0);
        }

        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().checked_sub(1);
        }

        fn next(&mut self) {
            self.pos = match self.pos {
                Some(i) if i + 1 < self.entries.len() => Some(i + 1),
                _ => None,
            };
        }

        fn prev(&mut self) {
            self.pos = match self.pos {
                Some(i) if i > 0 => Some(i - 1),
                _ => None,
            };
        }

        fn key(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].0
        }

        fn value(&self) -> &[u8] {
            &self.entries[self.pos.unwrap()].1
        }
    }

    fn sample_iter() -> Box<dyn TableIter> {
        Box::new(VecIter::new(vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
            (b"e".to_vec(), b"5".to_vec()),
        ]))
    }

    #[test]
    fn test_starts_invalid() {
        let it = FileNumberIterator::new(sample_iter(), 42);
        assert!(!it.valid());
    }

    #[test]
    fn test_delegates_and_tracks_validity() {
        let mut it = FileNumberIterator::new(sample_iter(), 42);

        it.seek_to_first();
        assert!(it.valid());
        assert_eq!(it.key(), b"a");
        assert_eq!(it.value(), b"1");
        assert_eq!(it.file_number(), 42);

        it.next();
        assert_eq!(it.key(), b"c");

        it.seek(b"d");
        assert!(it.valid());
        assert_eq!(it.key(), b"e");

        it.next();
        assert!(!it.valid());
    }

    #[test]
    fn test_seek_to_last_and_prev() {
        let mut it = FileNumberIterator::new(sample_iter(), 42);

        it.seek_to_last();
        assert_eq!(it.key(), b"e");

        it.prev();
        assert_eq!(it.key(), b"c");

        it.prev();
        it.prev();
        assert!(!it.valid());
    }

    #[test]
    fn test_make_invalid_is_sticky_until_repositioned() {
        let mut it = FileNumberIterator::new(sample_iter(), 42);

        it.seek_to_first();
        assert!(it.valid());

        it.make_invalid();
        assert!(!it.valid());

        // Repositioning consults the underlying iterator again.
        it.seek_to_first();
        assert!(it.valid());
        assert_eq!(it.key(), b"a");
    }

    #[test]
    fn test_set_replaces_wrapped_iterator() {
        let mut it = FileNumberIterator::new(sample_iter(), 42);
        it.seek_to_first();
        assert!(it.valid());

        it.set(Box::new(VecIter::new(vec![])));
        assert!(!it.valid());

        it.set(sample_iter());
        assert!(!it.valid());
        it.seek_to_first();
        assert_eq!(it.key(), b"a");
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_key_on_invalid_asserts() {
        let it = FileNumberIterator::new(sample_iter(), 42);
        let _ = it.key();
    }
}
