//! Configuration options for the revkv storage engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::partition::hashtable::MAX_CAPACITY;
use crate::partition::HEADER_REGION_SIZE;
use crate::posting::{HashCodePosting, KeyPosting, Posting, ValuePosting};

const MEGABYTE: u32 = 1024 * 1024;

/// Configuration options for opening a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Create the data directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Error if the data directory already exists.
    /// Default: false
    pub error_if_exists: bool,

    /// Number of buckets in the first hashtable generation, rounded up to
    /// a power of two.
    /// Default: 65536
    pub initial_capacity: u32,

    /// Size in bytes of each hash codes partition file, header included.
    /// Default: 4MB
    pub hash_codes_partition_size: u32,

    /// Size in bytes of each keys partition file, header included.
    /// Default: 8MB
    pub keys_partition_size: u32,

    /// Size in bytes of each values partition file, header included.
    /// Default: 16MB
    pub values_partition_size: u32,

    /// Keep replaced and removed key postings linked so that any past
    /// revision stays readable. When disabled, replaced postings are
    /// spliced out of their chain and some history becomes unreachable.
    /// Default: false
    pub durable_posting_links: bool,

    /// How long to wait for the store write lock, in milliseconds.
    /// `None` waits forever.
    /// Default: 60 seconds
    pub lock_wait_timeout_ms: Option<u64>,

    /// Interval between attempts to obtain a contended write lock.
    /// Default: 100 milliseconds
    pub lock_poll_interval_ms: u64,

    /// Factor to grow the hashtable capacity by when a rehash is suggested.
    /// Default: 1.7
    pub automatic_rehash_grow_factor: f64,

    /// Ratio of live keys to hashtable capacity above which a rehash is suggested.
    /// Default: 0.125
    pub automatic_rehash_threshold: f64,

    /// Maximum number of accessors checked out at the same time.
    /// Default: 20
    pub max_active_accessors: usize,

    /// Maximum number of idle accessors kept open in the pool.
    /// Default: 2
    pub max_idle_accessors: usize,

    /// How long a checkout blocks when the pool is exhausted, in milliseconds.
    /// Default: 1 second
    pub accessor_wait_ms: u64,

    /// Idle accessors older than this are closed, in milliseconds.
    /// Default: 30 seconds
    pub accessor_idle_eviction_ms: u64,

    /// Sync every file touched by a mutation before returning.
    /// Default: false
    pub sync_writes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            initial_capacity: 1 << 16,
            hash_codes_partition_size: 4 * MEGABYTE,
            keys_partition_size: 8 * MEGABYTE,
            values_partition_size: 16 * MEGABYTE,
            durable_posting_links: false,
            lock_wait_timeout_ms: Some(60_000),
            lock_poll_interval_ms: 100,
            automatic_rehash_grow_factor: 1.7,
            automatic_rehash_threshold: 0.125,
            max_active_accessors: 20,
            max_idle_accessors: 2,
            accessor_wait_ms: 1000,
            accessor_idle_eviction_ms: 30_000,
            sync_writes: false,
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the data directory if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether opening an existing data directory is an error.
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the bucket count of the first hashtable generation.
    pub fn initial_capacity(mut self, capacity: u32) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Sets the size of every partition kind at once.
    pub fn partition_size(mut self, size: u32) -> Self {
        self.hash_codes_partition_size = size;
        self.keys_partition_size = size;
        self.values_partition_size = size;
        self
    }

    /// Sets the hash codes partition size.
    pub fn hash_codes_partition_size(mut self, size: u32) -> Self {
        self.hash_codes_partition_size = size;
        self
    }

    /// Sets the keys partition size.
    pub fn keys_partition_size(mut self, size: u32) -> Self {
        self.keys_partition_size = size;
        self
    }

    /// Sets the values partition size.
    pub fn values_partition_size(mut self, size: u32) -> Self {
        self.values_partition_size = size;
        self
    }

    /// Enables or disables durable posting links.
    pub fn durable_posting_links(mut self, value: bool) -> Self {
        self.durable_posting_links = value;
        self
    }

    /// Sets the write lock wait timeout. `None` waits forever.
    pub fn lock_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_wait_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Sets the write lock poll interval.
    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the accessor pool bounds.
    pub fn accessor_pool(mut self, max_active: usize, max_idle: usize) -> Self {
        self.max_active_accessors = max_active;
        self.max_idle_accessors = max_idle;
        self
    }

    /// Sets how long a checkout waits for a free accessor.
    pub fn accessor_wait(mut self, wait: Duration) -> Self {
        self.accessor_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Enables or disables syncing after every mutation.
    pub fn sync_writes(mut self, value: bool) -> Self {
        self.sync_writes = value;
        self
    }

    /// The write lock wait timeout as a duration.
    pub fn lock_wait_timeout_duration(&self) -> Option<Duration> {
        self.lock_wait_timeout_ms.map(Duration::from_millis)
    }

    /// The write lock poll interval as a duration.
    pub fn lock_poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Loads options from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let data = std::fs::read(path)?;
        let options: Options = serde_json::from_slice(&data)?;
        options.validate()?;
        Ok(options)
    }

    /// Saves options to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.initial_capacity == 0 {
            return Err(crate::Error::invalid_argument("initial_capacity must be > 0"));
        }
        if self.initial_capacity > MAX_CAPACITY {
            return Err(crate::Error::invalid_argument(format!(
                "initial_capacity must not exceed {}, got {}",
                MAX_CAPACITY, self.initial_capacity
            )));
        }
        let minimums = [
            ("hash_codes_partition_size", self.hash_codes_partition_size, HashCodePosting::FIXED_SIZE),
            ("keys_partition_size", self.keys_partition_size, KeyPosting::FIXED_SIZE + 1),
            ("values_partition_size", self.values_partition_size, ValuePosting::FIXED_SIZE + 1),
        ];
        for (name, size, posting) in minimums {
            let required = HEADER_REGION_SIZE as u64 + posting as u64;
            if (size as u64) < required {
                return Err(crate::Error::invalid_argument(format!(
                    "{} must be at least {} bytes, got {}",
                    name, required, size
                )));
            }
        }
        if self.automatic_rehash_grow_factor <= 1.0 {
            return Err(crate::Error::invalid_argument(
                "automatic_rehash_grow_factor must be > 1",
            ));
        }
        if self.automatic_rehash_threshold <= 0.0 || self.automatic_rehash_threshold >= 1.0 {
            return Err(crate::Error::invalid_argument(
                "automatic_rehash_threshold must be between 0 and 1",
            ));
        }
        if self.max_active_accessors == 0 {
            return Err(crate::Error::invalid_argument("max_active_accessors must be > 0"));
        }
        if self.max_idle_accessors > self.max_active_accessors {
            return Err(crate::Error::invalid_argument(
                "max_idle_accessors must not exceed max_active_accessors",
            ));
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(crate::Error::invalid_argument("lock_poll_interval_ms must be > 0"));
        }
        Ok(())
    }
}
