//! Persistent store backing the key-location cache.
//!
//! A single store file laid out as:
//!
//! ```text
//! [header | redo journal | root | entry arena]
//! ```
//!
//! The root holds the allocator fields and the bucket heads; entries live in
//! the arena and link to each other through stable byte offsets (0
//! terminates a chain), so the structure survives reopen without any
//! address fixup.
//!
//! # Commit protocol
//!
//! Every mutation is a transaction: its writes are serialized into the
//! embedded journal (length + CRC32 + payload), synced, made visible by
//! syncing a separate commit word, and only then applied to the store image
//! and written through to the file. A crash before the commit word leaves
//! the store untouched; a crash after it is repaired on reopen by replaying
//! the journal record, which is an idempotent redo.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::options::LocationCacheOptions;
use crate::util::crc::{crc32, verify_crc};
use crate::{Error, Result};

/// Magic bytes at the start of a store file.
const MAGIC: &[u8; 8] = b"LOCCACH1";
/// Store format version.
const FORMAT_VERSION: u32 = 1;
/// Fixed header size.
const HEADER_SIZE: usize = 64;
/// Size of the embedded redo journal region.
const JOURNAL_SIZE: usize = 64 * 1024;
/// Journal bookkeeping: commit word, reserved, payload length, payload CRC.
const JOURNAL_HEADER: usize = 16;
const JOURNAL_OFF: usize = HEADER_SIZE;
const ROOT_OFF: usize = JOURNAL_OFF + JOURNAL_SIZE;
/// Root allocator fields (arena_next, free_head) before the bucket array.
const ROOT_FIXED: usize = 16;
/// Per-bucket root record: head offset + chain length.
const BUCKET_RECORD: usize = 16;
/// Smallest arena worth creating a store for.
const MIN_ARENA: usize = 4096;

const ARENA_NEXT_OFF: u64 = ROOT_OFF as u64;
const FREE_HEAD_OFF: u64 = ROOT_OFF as u64 + 8;

/// Field offsets within an arena entry record.
pub(crate) mod entry {
    /// Next entry in the chain, or next slot on the free list. 0 terminates.
    pub const NEXT: u64 = 0;
    /// File number the key maps to.
    pub const FILE_NUMBER: u64 = 8;
    /// Total slot size in bytes, header included. Survives free-list reuse.
    pub const SLOT_SIZE: u64 = 16;
    /// Length of the key bytes that follow the header.
    pub const KEY_LEN: u64 = 20;
    /// Size of the fixed entry header.
    pub const HEADER: usize = 24;
}

/// Minimum pool size able to hold the root for `nbuckets` buckets.
pub(crate) fn min_pool_size(nbuckets: usize) -> usize {
    ROOT_OFF + ROOT_FIXED + nbuckets * BUCKET_RECORD + MIN_ARENA
}

fn arena_off(nbuckets: usize) -> usize {
    ROOT_OFF + ROOT_FIXED + nbuckets * BUCKET_RECORD
}

/// Slot size needed for a key, 8-byte aligned.
fn slot_size_for(key_len: usize) -> usize {
    (entry::HEADER + key_len + 7) & !7
}

pub(crate) fn read_u32(img: &[u8], off: u64) -> u32 {
    let off = off as usize;
    u32::from_le_bytes(img[off..off + 4].try_into().unwrap())
}

pub(crate) fn read_u64(img: &[u8], off: u64) -> u64 {
    let off = off as usize;
    u64::from_le_bytes(img[off..off + 8].try_into().unwrap())
}

fn write_u32(img: &mut [u8], off: u64, v: u32) {
    let off = off as usize;
    img[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_u64(img: &mut [u8], off: u64, v: u64) {
    let off = off as usize;
    img[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// The chain link of the entry at `off`.
pub(crate) fn entry_next(img: &[u8], off: u64) -> u64 {
    read_u64(img, off + entry::NEXT)
}

/// The file number stored in the entry at `off`.
pub(crate) fn entry_file_number(img: &[u8], off: u64) -> u64 {
    read_u64(img, off + entry::FILE_NUMBER)
}

/// The key bytes of the entry at `off`.
pub(crate) fn entry_key(img: &[u8], off: u64) -> &[u8] {
    let key_len = read_u32(img, off + entry::KEY_LEN) as usize;
    let start = off as usize + entry::HEADER;
    &img[start..start + key_len]
}

fn write_at(file: &mut File, off: u64, bytes: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(off))?;
    file.write_all(bytes)
}

fn unavailable(context: &str, err: std::io::Error) -> Error {
    Error::store_unavailable(format!("{}: {}", context, err))
}

/// A set of writes applied as one atomic, durable unit.
///
/// Writes are applied in insertion order; a later write to the same offset
/// wins, both at commit and at replay.
pub(crate) struct Tx {
    writes: Vec<(u64, Vec<u8>)>,
}

impl Tx {
    pub fn new() -> Self {
        Self { writes: Vec::new() }
    }

    pub fn put_u64(&mut self, off: u64, v: u64) {
        self.writes.push((off, v.to_le_bytes().to_vec()));
    }

    pub fn put_bytes(&mut self, off: u64, bytes: Vec<u8>) {
        self.writes.push((off, bytes));
    }

    fn payload_len(&self) -> usize {
        self.writes.iter().map(|(_, b)| 12 + b.len()).sum()
    }

    fn serialize_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.payload_len());
        for (off, bytes) in &self.writes {
            payload.extend_from_slice(&off.to_le_bytes());
            payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(bytes);
        }
        payload
    }
}

/// Allocator state as seen by an in-progress transaction.
///
/// Loaded from the committed image once per transaction and updated as the
/// transaction stages allocator writes, so a single transaction can both
/// allocate and free without reading its own uncommitted state.
pub(crate) struct AllocView {
    pub(crate) arena_next: u64,
    pub(crate) free_head: u64,
}

/// The pool behind a location cache: an in-memory image of the store file
/// kept in sync with disk through journaled commits.
#[derive(Debug)]
pub(crate) struct Pool {
    image: RwLock<Vec<u8>>,
    /// Store-level lock: guards the file, the journal, and the allocator
    /// fields of the root for the duration of a commit.
    file: Mutex<File>,
    nbuckets: usize,
    bucket_capacity: usize,
    pool_size: usize,
}

impl Pool {
    /// Open the store at `path`, or create it if absent.
    pub fn open_or_create(path: &Path, options: &LocationCacheOptions) -> Result<Pool> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path, options)
        }
    }

    fn create(path: &Path, options: &LocationCacheOptions) -> Result<Pool> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| unavailable("create store file", e))?;

        let pool_size = options.pool_size;
        let nbuckets = options.nbuckets;
        let arena_off = arena_off(nbuckets);

        file.set_len(pool_size as u64)
            .map_err(|e| unavailable("preallocate store file", e))?;

        let mut image = vec![0u8; pool_size];
        image[0..8].copy_from_slice(MAGIC);
        write_u32(&mut image, 8, FORMAT_VERSION);
        write_u32(&mut image, 12, nbuckets as u32);
        write_u32(&mut image, 16, options.bucket_capacity as u32);
        write_u64(&mut image, 20, pool_size as u64);
        write_u64(&mut image, 28, JOURNAL_OFF as u64);
        write_u64(&mut image, 36, JOURNAL_SIZE as u64);
        write_u64(&mut image, 44, ROOT_OFF as u64);
        write_u64(&mut image, 52, arena_off as u64);
        // Root: arena_next starts at the arena base; free list and bucket
        // heads are all zero, which set_len already guarantees on disk.
        write_u64(&mut image, ARENA_NEXT_OFF, arena_off as u64);

        write_at(&mut file, 0, &image[..arena_off])
            .map_err(|e| unavailable("initialize store file", e))?;
        file.sync_all()
            .map_err(|e| unavailable("sync store file", e))?;

        tracing::debug!(
            path = %path.display(),
            nbuckets,
            bucket_capacity = options.bucket_capacity,
            pool_size,
            "created location cache store"
        );

        Ok(Pool {
            image: RwLock::new(image),
            file: Mutex::new(file),
            nbuckets,
            bucket_capacity: options.bucket_capacity,
            pool_size,
        })
    }

    fn open(path: &Path) -> Result<Pool> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| unavailable("open store file", e))?;

        let file_len = file
            .metadata()
            .map_err(|e| unavailable("stat store file", e))?
            .len();

        let mut header = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut header))
            .map_err(|e| unavailable("read store header", e))?;

        if &header[0..8] != MAGIC {
            return Err(Error::store_unavailable("bad magic, not a store file"));
        }
        let version = read_u32(&header, 8);
        if version != FORMAT_VERSION {
            return Err(Error::store_unavailable(format!(
                "unsupported store format version {}",
                version
            )));
        }
        let nbuckets = read_u32(&header, 12) as usize;
        let bucket_capacity = read_u32(&header, 16) as usize;
        let pool_size = read_u64(&header, 20) as usize;
        if nbuckets == 0 || bucket_capacity == 0 {
            return Err(Error::store_unavailable("corrupt store geometry"));
        }
        if pool_size as u64 != file_len {
            return Err(Error::store_unavailable(format!(
                "store file is {} bytes, header says {}",
                file_len, pool_size
            )));
        }
        if read_u64(&header, 28) != JOURNAL_OFF as u64
            || read_u64(&header, 36) != JOURNAL_SIZE as u64
            || read_u64(&header, 44) != ROOT_OFF as u64
            || read_u64(&header, 52) != arena_off(nbuckets) as u64
        {
            return Err(Error::store_unavailable("store layout mismatch"));
        }

        let mut image = vec![0u8; pool_size];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut image))
            .map_err(|e| unavailable("read store file", e))?;

        let pool = Pool {
            image: RwLock::new(image),
            file: Mutex::new(file),
            nbuckets,
            bucket_capacity,
            pool_size,
        };
        pool.replay_journal()?;

        tracing::debug!(
            path = %path.display(),
            nbuckets,
            bucket_capacity,
            "opened location cache store"
        );

        Ok(pool)
    }

    /// Apply a committed journal record left behind by a crash, if any.
    fn replay_journal(&self) -> Result<()> {
        let writes = {
            let image = self.image.read();
            if read_u32(&image, JOURNAL_OFF as u64) != 1 {
                // No commit word: nothing committed, any partial journal
                // record is dead and will be overwritten.
                return Ok(());
            }
            let payload_len = read_u32(&image, JOURNAL_OFF as u64 + 8) as usize;
            let crc = read_u32(&image, JOURNAL_OFF as u64 + 12);
            if payload_len > JOURNAL_SIZE - JOURNAL_HEADER {
                return Err(Error::store_unavailable("journal record overruns journal"));
            }
            let start = JOURNAL_OFF + JOURNAL_HEADER;
            let payload = &image[start..start + payload_len];
            if !verify_crc(payload, crc) {
                return Err(Error::store_unavailable(
                    "committed journal record fails checksum",
                ));
            }

            let mut writes: Vec<(u64, Vec<u8>)> = Vec::new();
            let mut pos = 0usize;
            while pos < payload.len() {
                if payload.len() - pos < 12 {
                    return Err(Error::store_unavailable("truncated journal record"));
                }
                let off = u64::from_le_bytes(payload[pos..pos + 8].try_into().unwrap());
                let len =
                    u32::from_le_bytes(payload[pos + 8..pos + 12].try_into().unwrap()) as usize;
                pos += 12;
                if payload.len() - pos < len || off as usize + len > self.pool_size {
                    return Err(Error::store_unavailable("journal write out of bounds"));
                }
                writes.push((off, payload[pos..pos + len].to_vec()));
                pos += len;
            }
            writes
        };

        let mut file = self.file.lock();
        {
            let mut image = self.image.write();
            for (off, bytes) in &writes {
                let off = *off as usize;
                image[off..off + bytes.len()].copy_from_slice(bytes);
            }
            write_u32(&mut image, JOURNAL_OFF as u64, 0);
        }
        for (off, bytes) in &writes {
            write_at(&mut file, *off, bytes).map_err(|e| unavailable("replay journal", e))?;
        }
        file.sync_data()
            .map_err(|e| unavailable("sync replayed writes", e))?;
        write_at(&mut file, JOURNAL_OFF as u64, &0u32.to_le_bytes())
            .map_err(|e| unavailable("clear journal", e))?;
        file.sync_data()
            .map_err(|e| unavailable("sync cleared journal", e))?;

        tracing::debug!(writes = writes.len(), "replayed committed journal record");
        Ok(())
    }

    pub fn nbuckets(&self) -> usize {
        self.nbuckets
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    /// Read access to the store image.
    pub fn image(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.image.read()
    }

    /// Root offset of bucket `b`'s chain head.
    pub fn bucket_head_off(&self, b: usize) -> u64 {
        debug_assert!(b < self.nbuckets);
        (ROOT_OFF + ROOT_FIXED + b * BUCKET_RECORD) as u64
    }

    /// Root offset of bucket `b`'s chain length.
    pub fn bucket_len_off(&self, b: usize) -> u64 {
        self.bucket_head_off(b) + 8
    }

    /// Take the store-level lock, serializing commits and allocator access.
    pub fn lock_store(&self) -> StoreLock<'_> {
        StoreLock {
            file: self.file.lock(),
            pool: self,
        }
    }
}

/// Exclusive access to the journal, the allocator, and the backing file.
pub(crate) struct StoreLock<'a> {
    file: MutexGuard<'a, File>,
    pool: &'a Pool,
}

impl StoreLock<'_> {
    /// Load the committed allocator state.
    pub fn alloc_view(&self) -> AllocView {
        let image = self.pool.image.read();
        AllocView {
            arena_next: read_u64(&image, ARENA_NEXT_OFF),
            free_head: read_u64(&image, FREE_HEAD_OFF),
        }
    }

    /// Reserve a slot big enough for `key_len` key bytes, staging the
    /// allocator writes into `tx`. Returns the slot offset and its size.
    ///
    /// Must be called before [`free`](Self::free) within one transaction:
    /// the free-list scan reads committed state only.
    pub fn allocate(&self, view: &mut AllocView, tx: &mut Tx, key_len: usize) -> Result<(u64, u32)> {
        let need = slot_size_for(key_len) as u64;
        let image = self.pool.image.read();

        // First fit from the free list.
        let mut prev = 0u64;
        let mut cur = view.free_head;
        while cur != 0 {
            let size = read_u32(&image, cur + entry::SLOT_SIZE) as u64;
            let next_free = read_u64(&image, cur + entry::NEXT);
            if size >= need {
                if prev == 0 {
                    tx.put_u64(FREE_HEAD_OFF, next_free);
                    view.free_head = next_free;
                } else {
                    tx.put_u64(prev + entry::NEXT, next_free);
                }
                return Ok((cur, size as u32));
            }
            prev = cur;
            cur = next_free;
        }

        // Bump the arena.
        let off = view.arena_next;
        if off + need > self.pool.pool_size as u64 {
            return Err(Error::StoreFull);
        }
        tx.put_u64(ARENA_NEXT_OFF, off + need);
        view.arena_next = off + need;
        Ok((off, need as u32))
    }

    /// Push the slot at `off` onto the free list, staging the writes into
    /// `tx`. The slot keeps its recorded size for later reuse.
    pub fn free(&self, view: &mut AllocView, tx: &mut Tx, off: u64) {
        tx.put_u64(off + entry::NEXT, view.free_head);
        tx.put_u64(FREE_HEAD_OFF, off);
        view.free_head = off;
    }

    /// Commit a transaction: journal it durably, then apply it to the image
    /// and write it through to the file.
    ///
    /// Once the commit word is durable the transaction is committed even if
    /// a later step fails; the image already reflects it and a reopen
    /// replays the journal to repair the file.
    pub fn commit(&mut self, tx: Tx) -> Result<()> {
        debug_assert!(!tx.writes.is_empty());
        self.stage_journal(&tx)?;
        self.apply_and_clear(&tx)
    }

    /// Write the journal record and sync the commit word. After this
    /// returns, the transaction survives a crash.
    fn stage_journal(&mut self, tx: &Tx) -> Result<()> {
        let payload = tx.serialize_payload();
        if payload.len() > JOURNAL_SIZE - JOURNAL_HEADER {
            return Err(Error::StoreFull);
        }
        let crc = crc32(&payload);

        let mut record = Vec::with_capacity(JOURNAL_HEADER + payload.len());
        record.extend_from_slice(&0u32.to_le_bytes()); // commit word, still clear
        record.extend_from_slice(&0u32.to_le_bytes()); // reserved
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc.to_le_bytes());
        record.extend_from_slice(&payload);

        write_at(&mut self.file, JOURNAL_OFF as u64, &record)?;
        self.file.sync_data()?;
        write_at(&mut self.file, JOURNAL_OFF as u64, &1u32.to_le_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    fn apply_and_clear(&mut self, tx: &Tx) -> Result<()> {
        {
            let mut image = self.pool.image.write();
            for (off, bytes) in &tx.writes {
                let off = *off as usize;
                debug_assert!(off + bytes.len() <= image.len());
                image[off..off + bytes.len()].copy_from_slice(bytes);
            }
        }
        for (off, bytes) in &tx.writes {
            write_at(&mut self.file, *off, bytes)?;
        }
        self.file.sync_data()?;
        write_at(&mut self.file, JOURNAL_OFF as u64, &0u32.to_le_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}
