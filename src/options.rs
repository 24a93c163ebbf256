//! Configuration options for readcache.

use crate::{Error, Result};

/// Default number of hash buckets in the location cache. Prime, to reduce
/// clustering.
pub const DEFAULT_NBUCKETS: usize = 1007;

/// Default maximum number of entries per location cache bucket.
pub const DEFAULT_BUCKET_CAPACITY: usize = 10;

/// Default preallocated size of the location cache store file (128MB).
pub const DEFAULT_POOL_SIZE: usize = 128 * 1024 * 1024;

/// Maximum key size accepted by the location cache (8KB).
pub const MAX_KEY_SIZE: usize = 8 * 1024;

/// Options for opening or creating a [`LocationCache`](crate::LocationCache).
///
/// Geometry (`nbuckets`, `bucket_capacity`, `pool_size`) only applies when a
/// new store file is created. An existing store carries its geometry in its
/// header, and that header is authoritative on reopen.
#[derive(Debug, Clone)]
pub struct LocationCacheOptions {
    /// Number of hash buckets. Should be prime.
    pub nbuckets: usize,

    /// Maximum number of entries a single bucket may hold. Inserting into a
    /// full bucket evicts that bucket's oldest entry.
    pub bucket_capacity: usize,

    /// Total size of the store file, preallocated at creation.
    pub pool_size: usize,
}

impl Default for LocationCacheOptions {
    fn default() -> Self {
        Self {
            nbuckets: DEFAULT_NBUCKETS,
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl LocationCacheOptions {
    /// Check that the options describe a usable store.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.nbuckets == 0 {
            return Err(Error::invalid_configuration("nbuckets must be non-zero"));
        }
        if self.bucket_capacity == 0 {
            return Err(Error::invalid_configuration(
                "bucket_capacity must be non-zero",
            ));
        }
        let min = crate::location::min_pool_size(self.nbuckets);
        if self.pool_size < min {
            return Err(Error::invalid_configuration(format!(
                "pool_size {} too small for {} buckets (minimum {})",
                self.pool_size, self.nbuckets, min
            )));
        }
        Ok(())
    }
}
