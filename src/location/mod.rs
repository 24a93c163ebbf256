//! Crash-consistent key-location cache.
//!
//! Maps a key to the file number of the table file currently holding it, as
//! a fast-path shortcut past the version lookup. The mapping is persistent:
//! after a crash and reopen, the observed state is exactly the committed
//! prefix of operations.
//!
//! Keys hash into a fixed number of buckets (prime-sized by default), each
//! an offset-linked chain in the store's arena. Every bucket is
//! independently capacity-bounded and independently locked, so operations
//! on distinct buckets do not contend on bucket locks.

mod store;

use std::path::Path;

use parking_lot::Mutex;

use crate::options::{LocationCacheOptions, MAX_KEY_SIZE};
use crate::util::hash::bucket_for;
use crate::{Error, Result};

use store::{entry, Pool, Tx};

pub(crate) use store::min_pool_size;

/// Outcome of a [`LocationCache::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was already present; its file number was updated in place.
    Updated,
    /// The key was added to a bucket with room to spare.
    Inserted,
    /// The key was added to a full bucket, evicting that bucket's oldest
    /// entry in the same transaction.
    InsertedWithEviction,
}

/// Outcome of a [`LocationCache::replace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The stored file number matched the expectation and was replaced.
    Replaced,
    /// The stored file number differed from the expectation; nothing changed.
    Conflict,
    /// The key is not present; nothing changed.
    NotFound,
}

/// What a bucket-chain walk found, while the bucket lock is held.
struct BucketScan {
    /// Offset and stored file number of the matching entry, if any.
    found: Option<(u64, u64)>,
    /// Number of entries in the chain.
    len: usize,
    /// Chain head offset (0 if the bucket is empty).
    head: u64,
    /// Chain tail offset: the oldest entry, first inserted and never
    /// relinked by updates.
    tail: u64,
    /// The entry linking to the tail (0 if the tail is the head).
    tail_prev: u64,
}

/// Durable hash table from key bytes to table file numbers.
#[derive(Debug)]
pub struct LocationCache {
    pool: Pool,
    /// One lock per bucket, held for the whole scan-decide-commit sequence.
    bucket_locks: Vec<Mutex<()>>,
}

impl LocationCache {
    /// Open the store at `path`, or create it with default options.
    ///
    /// Fails with [`Error::StoreUnavailable`] if the file cannot be opened,
    /// created, or recovered; the caller decides whether that is fatal.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_or_create_with_options(path, LocationCacheOptions::default())
    }

    /// Open the store at `path`, or create it with the given options.
    ///
    /// For an existing store the geometry recorded in its header wins over
    /// `options`.
    pub fn open_or_create_with_options(
        path: impl AsRef<Path>,
        options: LocationCacheOptions,
    ) -> Result<Self> {
        options.validate()?;
        let pool = Pool::open_or_create(path.as_ref(), &options)?;
        let bucket_locks = (0..pool.nbuckets()).map(|_| Mutex::new(())).collect();
        Ok(Self { pool, bucket_locks })
    }

    /// Number of hash buckets.
    pub fn nbuckets(&self) -> usize {
        self.pool.nbuckets()
    }

    /// Maximum entries per bucket.
    pub fn bucket_capacity(&self) -> usize {
        self.pool.bucket_capacity()
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        bucket_for(key, self.pool.nbuckets())
    }

    fn scan_bucket(&self, image: &[u8], bucket: usize, key: &[u8]) -> BucketScan {
        let head = store::read_u64(image, self.pool.bucket_head_off(bucket));
        let mut scan = BucketScan {
            found: None,
            len: 0,
            head,
            tail: 0,
            tail_prev: 0,
        };
        let mut prev = 0u64;
        let mut cur = head;
        while cur != 0 {
            scan.len += 1;
            if scan.found.is_none() && store::entry_key(image, cur) == key {
                scan.found = Some((cur, store::entry_file_number(image, cur)));
            }
            let next = store::entry_next(image, cur);
            if next == 0 {
                scan.tail = cur;
                scan.tail_prev = prev;
            }
            prev = cur;
            cur = next;
        }
        debug_assert_eq!(
            scan.len as u64,
            store::read_u64(image, self.pool.bucket_len_off(bucket))
        );
        scan
    }

    /// Map `key` to `file_number`.
    ///
    /// Updates in place if the key is present. Otherwise links a new entry
    /// at the chain head, evicting the bucket's oldest entry first when the
    /// bucket is at capacity — within the same transaction, so the bucket
    /// never transiently exceeds its capacity.
    pub fn insert(&self, key: &[u8], file_number: u64) -> Result<InsertOutcome> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }

        let bucket = self.bucket_of(key);
        let _guard = self.bucket_locks[bucket].lock();

        let scan = {
            let image = self.pool.image();
            self.scan_bucket(&image, bucket, key)
        };

        let mut store = self.pool.lock_store();
        let mut tx = Tx::new();

        if let Some((off, _)) = scan.found {
            tx.put_u64(off + entry::FILE_NUMBER, file_number);
            store.commit(tx)?;
            return Ok(InsertOutcome::Updated);
        }

        let evicting = scan.len >= self.pool.bucket_capacity();
        let mut view = store.alloc_view();
        let (new_off, slot_size) = store.allocate(&mut view, &mut tx, key.len())?;

        // The new entry heads the chain. If the eviction victim is the only
        // entry, the new chain is just the new entry.
        let next = if evicting && scan.tail == scan.head {
            0
        } else {
            scan.head
        };
        let mut record = Vec::with_capacity(entry::HEADER + key.len());
        record.extend_from_slice(&next.to_le_bytes());
        record.extend_from_slice(&file_number.to_le_bytes());
        record.extend_from_slice(&slot_size.to_le_bytes());
        record.extend_from_slice(&(key.len() as u32).to_le_bytes());
        record.extend_from_slice(key);
        tx.put_bytes(new_off, record);

        if evicting {
            if scan.tail_prev != 0 {
                tx.put_u64(scan.tail_prev + entry::NEXT, 0);
            }
            store.free(&mut view, &mut tx, scan.tail);
        } else {
            tx.put_u64(self.pool.bucket_len_off(bucket), (scan.len + 1) as u64);
        }
        tx.put_u64(self.pool.bucket_head_off(bucket), new_off);
        store.commit(tx)?;

        Ok(if evicting {
            InsertOutcome::InsertedWithEviction
        } else {
            InsertOutcome::Inserted
        })
    }

    /// Conditionally update `key` to `new_file_number`, but only if the
    /// stored file number equals `expected_file_number`.
    ///
    /// The optimistic check stops a stale caller from silently overwriting
    /// a mapping a concurrent compaction already moved.
    pub fn replace(
        &self,
        key: &[u8],
        expected_file_number: u64,
        new_file_number: u64,
    ) -> Result<ReplaceOutcome> {
        let bucket = self.bucket_of(key);
        let _guard = self.bucket_locks[bucket].lock();

        let scan = {
            let image = self.pool.image();
            self.scan_bucket(&image, bucket, key)
        };

        match scan.found {
            None => Ok(ReplaceOutcome::NotFound),
            Some((_, stored)) if stored != expected_file_number => Ok(ReplaceOutcome::Conflict),
            Some((off, _)) => {
                let mut store = self.pool.lock_store();
                let mut tx = Tx::new();
                tx.put_u64(off + entry::FILE_NUMBER, new_file_number);
                store.commit(tx)?;
                Ok(ReplaceOutcome::Replaced)
            }
        }
    }

    /// Look up the file number stored for `key`, if any.
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        let bucket = self.bucket_of(key);
        let _guard = self.bucket_locks[bucket].lock();
        let image = self.pool.image();
        self.scan_bucket(&image, bucket, key)
            .found
            .map(|(_, file_number)| file_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_small(path: &Path, nbuckets: usize, bucket_capacity: usize) -> LocationCache {
        LocationCache::open_or_create_with_options(
            path,
            LocationCacheOptions {
                nbuckets,
                bucket_capacity,
                pool_size: min_pool_size(nbuckets) + 256 * 1024,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_insert_then_get() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 17, 10);

        assert_eq!(cache.insert(b"apple", 3).unwrap(), InsertOutcome::Inserted);
        assert_eq!(cache.insert(b"banana", 5).unwrap(), InsertOutcome::Inserted);

        assert_eq!(cache.get(b"apple"), Some(3));
        assert_eq!(cache.get(b"banana"), Some(5));
        assert_eq!(cache.get(b"cherry"), None);
    }

    #[test]
    fn test_insert_updates_in_place() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 17, 10);

        assert_eq!(cache.insert(b"key0", 1).unwrap(), InsertOutcome::Inserted);
        assert_eq!(cache.insert(b"key0", 1).unwrap(), InsertOutcome::Updated);
        assert_eq!(cache.insert(b"key0", 2).unwrap(), InsertOutcome::Updated);
        assert_eq!(cache.get(b"key0"), Some(2));
    }

    #[test]
    fn test_replace_contract() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 17, 10);

        cache.insert(b"key0", 1).unwrap();
        cache.insert(b"key0", 2).unwrap();

        assert_eq!(
            cache.replace(b"key1", 2, 3).unwrap(),
            ReplaceOutcome::NotFound
        );
        assert_eq!(
            cache.replace(b"key0", 1, 3).unwrap(),
            ReplaceOutcome::Conflict
        );
        assert_eq!(cache.get(b"key0"), Some(2));

        assert_eq!(
            cache.replace(b"key0", 2, 3).unwrap(),
            ReplaceOutcome::Replaced
        );
        assert_eq!(cache.get(b"key0"), Some(3));
    }

    #[test]
    fn test_full_bucket_evicts_oldest() {
        let dir = tempdir().unwrap();
        // Single bucket: every key collides.
        let cache = open_small(&dir.path().join("kloc"), 1, 3);

        assert_eq!(cache.insert(b"first", 1).unwrap(), InsertOutcome::Inserted);
        assert_eq!(cache.insert(b"second", 2).unwrap(), InsertOutcome::Inserted);
        assert_eq!(cache.insert(b"third", 3).unwrap(), InsertOutcome::Inserted);

        // Updating an entry must not promote it in eviction order.
        assert_eq!(cache.insert(b"first", 9).unwrap(), InsertOutcome::Updated);

        assert_eq!(
            cache.insert(b"fourth", 4).unwrap(),
            InsertOutcome::InsertedWithEviction
        );
        assert_eq!(cache.get(b"first"), None);
        assert_eq!(cache.get(b"second"), Some(2));
        assert_eq!(cache.get(b"third"), Some(3));
        assert_eq!(cache.get(b"fourth"), Some(4));

        assert_eq!(
            cache.insert(b"fifth", 5).unwrap(),
            InsertOutcome::InsertedWithEviction
        );
        assert_eq!(cache.get(b"second"), None);
        assert_eq!(cache.get(b"fifth"), Some(5));
    }

    #[test]
    fn test_capacity_one_bucket() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 1, 1);

        assert_eq!(cache.insert(b"a", 1).unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            cache.insert(b"b", 2).unwrap(),
            InsertOutcome::InsertedWithEviction
        );
        assert_eq!(cache.get(b"a"), None);
        assert_eq!(cache.get(b"b"), Some(2));
    }

    #[test]
    fn test_durability_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kloc");

        {
            let cache = open_small(&path, 17, 10);
            for i in 0..100u64 {
                let key = format!("persist_{}", i);
                cache.insert(key.as_bytes(), i).unwrap();
            }
            cache.replace(b"persist_7", 7, 700).unwrap();
        }

        let cache = open_small(&path, 17, 10);
        assert_eq!(cache.get(b"persist_7"), Some(700));
        for i in 0..100u64 {
            if i == 7 {
                continue;
            }
            let key = format!("persist_{}", i);
            assert_eq!(cache.get(key.as_bytes()), Some(i));
        }
    }

    #[test]
    fn test_eviction_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kloc");

        {
            let cache = open_small(&path, 1, 2);
            cache.insert(b"old", 1).unwrap();
            cache.insert(b"mid", 2).unwrap();
            cache.insert(b"new", 3).unwrap();
        }

        let cache = open_small(&path, 1, 2);
        assert_eq!(cache.get(b"old"), None);
        assert_eq!(cache.get(b"mid"), Some(2));
        assert_eq!(cache.get(b"new"), Some(3));
    }

    #[test]
    fn test_key_too_large() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 17, 10);

        let big = vec![b'x'; MAX_KEY_SIZE + 1];
        assert!(matches!(
            cache.insert(&big, 1),
            Err(Error::KeyTooLarge { .. })
        ));
    }

    #[test]
    fn test_keys_with_shared_prefix() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 1, 10);

        cache.insert(b"ab", 1).unwrap();
        cache.insert(b"abc", 2).unwrap();

        // Exact key match, not prefix match.
        assert_eq!(cache.get(b"ab"), Some(1));
        assert_eq!(cache.get(b"abc"), Some(2));
        assert_eq!(cache.get(b"a"), None);
    }

    #[test]
    fn test_evicted_slot_reused() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 1, 1);

        cache.insert(b"aaaa", 1).unwrap();
        // Each insert evicts the previous same-sized entry; the arena must
        // not grow without bound.
        let arena_after_first = {
            let store = cache.pool.lock_store();
            let view = store.alloc_view();
            view
        };
        for i in 0..50u64 {
            cache.insert(format!("k{:03}", i).as_bytes(), i).unwrap();
        }
        let store = cache.pool.lock_store();
        let view = store.alloc_view();
        // One live entry plus at most one free slot beyond the first
        // allocation's high-water mark.
        assert!(view.arena_next <= arena_after_first.arena_next + 64);
    }

    #[test]
    fn test_concurrent_inserts_same_bucket() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 1, 64);

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..8u64 {
                        let key = format!("t{}_{}", t, i);
                        cache.insert(key.as_bytes(), t * 100 + i).unwrap();
                    }
                });
            }
        });

        // Serialized, no lost updates: all 32 distinct keys observable.
        for t in 0..4u64 {
            for i in 0..8u64 {
                let key = format!("t{}_{}", t, i);
                assert_eq!(cache.get(key.as_bytes()), Some(t * 100 + i));
            }
        }
    }

    #[test]
    fn test_concurrent_inserts_distinct_buckets() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 101, 10);

        std::thread::scope(|s| {
            for t in 0..8u64 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..32u64 {
                        let key = format!("worker{}_key{}", t, i);
                        cache.insert(key.as_bytes(), t).unwrap();
                    }
                });
            }
        });

        for t in 0..8u64 {
            for i in 0..32u64 {
                let key = format!("worker{}_key{}", t, i);
                assert_eq!(cache.get(key.as_bytes()), Some(t));
            }
        }
    }

    #[test]
    fn test_concurrent_update_single_key() {
        let dir = tempdir().unwrap();
        let cache = open_small(&dir.path().join("kloc"), 17, 10);
        cache.insert(b"contended", 0).unwrap();

        std::thread::scope(|s| {
            for t in 1..=4u64 {
                let cache = &cache;
                s.spawn(move || {
                    cache.insert(b"contended", t).unwrap();
                });
            }
        });

        // One of the writers won; the entry is intact either way.
        let v = cache.get(b"contended").unwrap();
        assert!((1..=4).contains(&v));
    }
}
