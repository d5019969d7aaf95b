//! The store façade.
//!
//! [`Store`] owns the configuration, the write lock and the accessor pool
//! of one data directory. Every operation takes the [`Accessor`] to run
//! on, so callers decide how long a session lasts:
//!
//! - `get`, `contains_key` and the keys cursor take no lock.
//! - `put`, `remove` and `rehash` run under the write lock.

mod read;
mod rehash;
mod write;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::accessor::Accessor;
use crate::config::Options;
use crate::cursor::{KeysCursor, KeysIter};
use crate::error::{Error, Result};
use crate::lock::WriteLock;
use crate::metadata::MetadataFile;
use crate::partition::hashtable::MAX_CAPACITY;
use crate::pool::{AccessorPool, PooledAccessor};
use crate::posting::MAX_WRITE_REVISION;

/// Revision that sees every committed write.
pub const LATEST: u64 = u64::MAX;

/// A stored value.
///
/// `Null` is a key stored without a value, which is different from a key
/// that is not stored at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// The key is present with no value.
    Null,
    /// The key is present with these bytes.
    Bytes(Bytes),
}

impl Value {
    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The value bytes, `None` for a null value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Null => None,
            Value::Bytes(bytes) => Some(bytes),
        }
    }

    /// Converts into the value bytes, `None` for a null value.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Value::Null => None,
            Value::Bytes(bytes) => Some(bytes),
        }
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::from(s.as_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(bytes))
    }
}

/// Counters of a store, read from its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Latest committed revision.
    pub store_revision: u64,
    /// Number of live keys.
    pub key_count: u64,
    /// Number of value postings ever written.
    pub value_postings_count: u64,
    /// Current hashtable generation.
    pub hashtable_id: u32,
    /// Buckets in the current hashtable generation.
    pub hashtable_capacity: u32,
    /// Hash codes partition receiving appends.
    pub current_hash_codes: u32,
    /// Keys partition receiving appends.
    pub current_keys: u32,
    /// Values partition receiving appends.
    pub current_values: u32,
}

/// An open store.
#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    options: Arc<Options>,
    lock: Arc<WriteLock>,
    pool: AccessorPool,
}

impl Store {
    /// Opens the store in `path`, bootstrapping it if it is new.
    ///
    /// # Arguments
    ///
    /// * `path` - Data directory of the store
    /// * `options` - Configuration options
    ///
    /// # Errors
    ///
    /// Fails if the options are invalid, if the directory is missing and
    /// `create_if_missing` is off, or if the store exists and
    /// `error_if_exists` is on.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        options.validate()?;
        let dir = path.as_ref().to_path_buf();
        log::info!("Opening store at {:?}", dir);

        if dir.exists() {
            if options.error_if_exists && MetadataFile::path(&dir).exists() {
                return Err(Error::AlreadyExists(dir.display().to_string()));
            }
        } else if options.create_if_missing {
            fs::create_dir_all(&dir)?;
        } else {
            return Err(Error::NotFound(dir.display().to_string()));
        }

        let options = Arc::new(options);
        let lock = Arc::new(WriteLock::open(&dir, options.lock_poll_interval_duration())?);
        let pool = AccessorPool::new(dir.clone(), Arc::clone(&options), Arc::clone(&lock));
        let store = Self { dir, options, lock, pool };

        {
            let mut accessor = store.accessor()?;
            let meta = accessor.metadata()?;
            log::info!(
                "Store opened at revision {} with {} keys (hashtable generation {})",
                meta.store_revision,
                meta.key_count,
                meta.hashtable_id
            );
        }
        Ok(store)
    }

    /// Data directory of the store.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The store write lock.
    pub fn write_lock(&self) -> &WriteLock {
        &self.lock
    }

    /// Checks an accessor out of the pool. It returns to the pool when dropped.
    pub fn accessor(&self) -> Result<PooledAccessor<'_>> {
        self.pool.checkout()
    }

    /// Runs `f` with a pooled accessor.
    pub fn with_accessor<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Accessor) -> Result<T>,
    {
        let mut accessor = self.accessor()?;
        f(&mut accessor)
    }

    /// A cursor over the keys visible at `revision`.
    pub fn keys(&self, revision: u64) -> KeysCursor {
        KeysCursor::new(revision)
    }

    /// Iterates the keys visible at `revision`.
    pub fn iter_keys<'a>(&self, accessor: &'a mut Accessor, revision: u64) -> KeysIter<'a> {
        self.keys(revision).iter(accessor)
    }

    /// Number of live keys.
    pub fn len(&self, accessor: &mut Accessor) -> Result<u64> {
        Ok(accessor.metadata()?.key_count)
    }

    /// Returns true if no key is live.
    pub fn is_empty(&self, accessor: &mut Accessor) -> Result<bool> {
        Ok(self.len(accessor)? == 0)
    }

    /// Current counters of the store.
    pub fn stats(&self, accessor: &mut Accessor) -> Result<StoreStats> {
        let meta = accessor.metadata()?;
        let hashtable_capacity = accessor.hashtable()?.capacity();
        Ok(StoreStats {
            store_revision: meta.store_revision,
            key_count: meta.key_count,
            value_postings_count: meta.value_postings_count,
            hashtable_id: meta.hashtable_id,
            hashtable_capacity,
            current_hash_codes: meta.current_hash_codes,
            current_keys: meta.current_keys,
            current_values: meta.current_values,
        })
    }

    /// Returns the capacity to rehash to when the live keys exceed the
    /// configured load threshold, `None` otherwise.
    ///
    /// The store never rehashes by itself.
    pub fn suggested_rehash_capacity(&self, accessor: &mut Accessor) -> Result<Option<u32>> {
        let key_count = accessor.metadata()?.key_count;
        let capacity = accessor.hashtable()?.capacity();
        let threshold = capacity as f64 * self.options.automatic_rehash_threshold;
        if (key_count as f64) <= threshold || capacity >= MAX_CAPACITY {
            return Ok(None);
        }
        let grown = (capacity as f64 * self.options.automatic_rehash_grow_factor).ceil();
        let target = (grown.min(MAX_CAPACITY as f64) as u32).next_power_of_two();
        Ok(Some(target.min(MAX_CAPACITY)))
    }

    /// Closes the store, syncing and closing idle accessors.
    pub fn close(self) -> Result<()> {
        if self.pool.active() > 0 {
            log::warn!("Closing store with {} accessors still checked out", self.pool.active());
        }
        self.pool.clear()?;
        log::info!("Closed store at {:?}", self.dir);
        Ok(())
    }
}

pub(crate) fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("key must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_write_revision(revision: u64) -> Result<()> {
    if revision > MAX_WRITE_REVISION {
        return Err(Error::invalid_argument(format!(
            "cannot write at revision {}, the largest is {}",
            revision, MAX_WRITE_REVISION
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_value_conversions() {
        let value = Value::from("abc");
        assert_eq!(value.as_bytes(), Some(&b"abc"[..]));
        assert!(!value.is_null());
        assert_eq!(value.into_bytes(), Some(Bytes::from_static(b"abc")));

        assert!(Value::Null.is_null());
        assert_eq!(Value::Null.as_bytes(), None);
        assert_eq!(Value::from(vec![1u8, 2]), Value::Bytes(Bytes::from_static(&[1, 2])));
    }

    #[test]
    fn test_open_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing");
        let err = Store::open(&path, Options::default().create_if_missing(false)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_open_error_if_exists() {
        let dir = TempDir::new().unwrap();
        let options = Options::default().initial_capacity(16);
        Store::open(dir.path(), options.clone()).unwrap().close().unwrap();

        let err = Store::open(dir.path(), options.error_if_exists(true)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_suggested_rehash_capacity() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), Options::default().initial_capacity(16)).unwrap();
        let mut acc = store.accessor().unwrap();

        assert_eq!(store.suggested_rehash_capacity(&mut acc).unwrap(), None);
        // 16 * 0.125 = 2 keys fit before growing.
        for i in 0u8..3 {
            store.put(&mut acc, &[i + 1], i as u64, Some(b"v"), 1).unwrap();
        }
        assert_eq!(store.len(&mut acc).unwrap(), 3);
        // 16 * 1.7 = 27.2, rounded up to a power of two.
        assert_eq!(store.suggested_rehash_capacity(&mut acc).unwrap(), Some(32));
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), Options::default().initial_capacity(64)).unwrap();
        let mut acc = store.accessor().unwrap();

        let rev = acc.increase_store_revision().unwrap();
        store.put(&mut acc, b"a", 1, Some(b"1"), rev).unwrap();
        store.put(&mut acc, b"b", 2, None, rev).unwrap();

        let stats = store.stats(&mut acc).unwrap();
        assert_eq!(stats.store_revision, 1);
        assert_eq!(stats.key_count, 2);
        assert_eq!(stats.value_postings_count, 1);
        assert_eq!(stats.hashtable_capacity, 64);
        assert_eq!(stats.hashtable_id, 0);
    }
}
