//! Lock-free reads: `get` and `contains_key`.

use super::{validate_key, Store, Value};
use crate::accessor::Accessor;
use crate::error::Result;
use crate::partition::{HashCodes, Keys, Values};
use crate::posting::{CycleGuard, HashCodePosting, KeyPosting, Location, Posting};

/// Walks a bucket chain for the hash code posting of `hash` visible at `revision`.
pub(super) fn find_hash_code(
    accessor: &mut Accessor,
    head: Option<Location>,
    hash: u64,
    revision: u64,
) -> Result<Option<(Location, HashCodePosting)>> {
    let mut guard = CycleGuard::new();
    let mut cursor = head;
    while let Some(location) = cursor {
        guard.visit(location)?;
        let posting = accessor.read::<HashCodes>(location)?;
        if posting.hash == hash && posting.is_visible(revision) {
            return Ok(Some((location, posting)));
        }
        cursor = posting.next;
    }
    Ok(None)
}

/// Walks a key chain for the posting of `key` visible at `revision`.
pub(super) fn find_key_posting(
    accessor: &mut Accessor,
    head: Option<Location>,
    key: &[u8],
    revision: u64,
) -> Result<Option<(Location, KeyPosting)>> {
    let mut guard = CycleGuard::new();
    let mut cursor = head;
    while let Some(location) = cursor {
        guard.visit(location)?;
        let posting = accessor.read::<Keys>(location)?;
        if posting.key == key && posting.is_visible(revision) {
            return Ok(Some((location, posting)));
        }
        cursor = posting.next;
    }
    Ok(None)
}

/// Resolves `value` links to a [`Value`].
pub(super) fn load_value(accessor: &mut Accessor, value: Option<Location>) -> Result<Value> {
    match value {
        Some(location) => Ok(Value::Bytes(accessor.read::<Values>(location)?.value)),
        None => Ok(Value::Null),
    }
}

impl Store {
    fn lookup(
        &self,
        accessor: &mut Accessor,
        key: &[u8],
        hash: u64,
        revision: u64,
    ) -> Result<Option<KeyPosting>> {
        validate_key(key)?;
        let table = accessor.hashtable()?;
        let bucket = table.read_bucket(table.bucket_offset(hash))?;
        if !bucket.is_visible(revision) {
            return Ok(None);
        }
        let Some((_, hash_code)) = find_hash_code(accessor, bucket.head, hash, revision)? else {
            return Ok(None);
        };
        let found = find_key_posting(accessor, hash_code.first_key, key, revision)?;
        Ok(found.map(|(_, posting)| posting))
    }

    /// Reads the value of `key` as of `revision`.
    ///
    /// # Arguments
    ///
    /// * `key` - Non-empty key bytes
    /// * `hash` - Hash code of the key, computed by the caller
    /// * `revision` - Revision to read at, [`LATEST`](super::LATEST) for the newest
    ///
    /// Returns `None` if the key is not stored at `revision` and
    /// `Some(Value::Null)` if it is stored without a value.
    pub fn get(
        &self,
        accessor: &mut Accessor,
        key: &[u8],
        hash: u64,
        revision: u64,
    ) -> Result<Option<Value>> {
        match self.lookup(accessor, key, hash, revision)? {
            Some(posting) => Ok(Some(load_value(accessor, posting.value)?)),
            None => Ok(None),
        }
    }

    /// Returns true if `key` is stored as of `revision`.
    pub fn contains_key(
        &self,
        accessor: &mut Accessor,
        key: &[u8],
        hash: u64,
        revision: u64,
    ) -> Result<bool> {
        let found = self.lookup(accessor, key, hash, revision)?;
        Ok(found.is_some_and(|posting| posting.stamp.created <= revision))
    }
}
