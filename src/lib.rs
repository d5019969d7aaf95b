//! # revkv - A Revision-Versioned Key-Value Storage Engine
//!
//! revkv is an embedded key-value storage engine built on append-only,
//! partitioned hash chains. Every record carries the revision it was created
//! at and the revision it was deleted at, so any past revision can be read
//! without copying data.
//!
//! ## Architecture
//!
//! A lookup walks four layers of files:
//!
//! - **Hashtable**: fixed array of buckets, selected by `hash & (capacity - 1)`
//! - **Hash codes partitions**: chains of full 64-bit hash codes per bucket
//! - **Keys partitions**: chains of exact keys per hash code
//! - **Values partitions**: the stored bytes
//!
//! Partitions are append-only files of fixed size; a full partition rolls
//! over to the next id. A single metadata file tracks the store revision,
//! the current hashtable generation and the partitions receiving appends.
//!
//! Reads take no lock. Mutations run under a reentrant write lock that also
//! excludes other processes. [`Store::rehash`] rebuilds the hashtable and
//! hash code layer at a new capacity without touching keys or values.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use revkv::{Options, Store, Value, LATEST};
//!
//! # fn main() -> Result<(), revkv::Error> {
//! let store = Store::open("./data", Options::default())?;
//! let mut accessor = store.accessor()?;
//!
//! // Each write is stamped with a revision
//! let rev = accessor.increase_store_revision()?;
//! store.put(&mut accessor, b"key1", 0x1234, Some(b"value1"), rev)?;
//!
//! // Read at the latest revision, or any earlier one
//! assert_eq!(store.get(&mut accessor, b"key1", 0x1234, LATEST)?, Some(Value::from("value1")));
//! assert_eq!(store.get(&mut accessor, b"key1", 0x1234, rev - 1)?, None);
//!
//! // Remove the key
//! let rev = accessor.increase_store_revision()?;
//! store.remove(&mut accessor, b"key1", 0x1234, rev)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod accessor;
pub mod config;
pub mod cursor;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod partition;
pub mod pool;
pub mod posting;
pub mod store;

// Re-exports
pub use accessor::Accessor;
pub use config::Options;
pub use cursor::{KeysCursor, KeysIter};
pub use error::{Error, Result};
pub use lock::{WriteLock, WriteLockGuard};
pub use pool::{AccessorPool, PooledAccessor};
pub use posting::KeyPosting;
pub use store::{Store, StoreStats, Value, LATEST};
