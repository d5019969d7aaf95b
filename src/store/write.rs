//! Mutations: `put` and `remove`.
//!
//! Both run under the write lock. A posting is always written in full
//! before any link to it is, so a concurrent reader only ever follows links
//! to complete postings.

use std::sync::Arc;

use bytes::Bytes;

use super::read::{find_hash_code, load_value};
use super::{validate_key, validate_write_revision, Store, Value};
use crate::accessor::Accessor;
use crate::error::{Error, Result};
use crate::partition::{HashCodes, Keys, Values};
use crate::posting::{
    BucketPosting, CycleGuard, Flag, HashCodePosting, KeyPosting, Location, Posting, ValuePosting,
};

/// Where a key posting sits in its chain.
struct ChainPosition {
    location: Location,
    posting: KeyPosting,
    previous: Option<Location>,
}

/// Result of a full walk over one key chain.
struct KeyChainScan {
    target: Option<ChainPosition>,
    tail: Option<Location>,
    others_visible: bool,
}

fn scan_key_chain(
    accessor: &mut Accessor,
    head: Option<Location>,
    key: &[u8],
    revision: u64,
    stop_at_target: bool,
) -> Result<KeyChainScan> {
    let mut guard = CycleGuard::new();
    let mut scan = KeyChainScan { target: None, tail: None, others_visible: false };
    let mut cursor = head;
    while let Some(location) = cursor {
        guard.visit(location)?;
        let posting = accessor.read::<Keys>(location)?;
        cursor = posting.next;
        let visible = posting.is_visible(revision);
        if scan.target.is_none() && visible && posting.key == key {
            scan.target = Some(ChainPosition { location, posting, previous: scan.tail });
            if stop_at_target {
                return Ok(scan);
            }
        } else if visible {
            scan.others_visible = true;
        }
        scan.tail = Some(location);
    }
    Ok(scan)
}

/// Points whatever precedes a key posting at `target`: the previous key
/// posting, or the hash code posting when it heads the chain.
fn relink_previous(
    accessor: &mut Accessor,
    previous: Option<Location>,
    hash_code: Location,
    target: Option<Location>,
) -> Result<()> {
    match previous {
        Some(location) => accessor.set_link::<Keys>(location, KeyPosting::NEXT_OFFSET, target),
        None => {
            accessor.set_link::<HashCodes>(hash_code, HashCodePosting::FIRST_KEY_OFFSET, target)
        }
    }
}

/// Reserves room for `posting` and writes it, before anything links to it.
fn append_key(accessor: &mut Accessor, posting: &KeyPosting) -> Result<Location> {
    let location = accessor.request_write::<Keys>(posting.encoded_len() as u64)?;
    accessor.write::<Keys>(location, posting)?;
    Ok(location)
}

/// Marks a value posting deleted and returns its contents.
fn retire_value(accessor: &mut Accessor, value: Option<Location>, revision: u64) -> Result<Value> {
    let old = load_value(accessor, value)?;
    if let Some(location) = value {
        accessor.mark_deleted::<Values>(location, revision)?;
    }
    Ok(old)
}

impl Store {
    /// Stores `value` under `key` at `revision`.
    ///
    /// A `None` or empty value stores the key with a null value.
    ///
    /// # Arguments
    ///
    /// * `key` - Non-empty key bytes
    /// * `hash` - Hash code of the key, computed by the caller
    /// * `value` - Value bytes, `None` for null
    /// * `revision` - Revision the write is stamped with
    ///
    /// Returns the value the key had before, or `None` if it was not stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the write lock could not be
    /// obtained and [`Error::PostingTooLarge`] if the key or value cannot
    /// fit in a partition. Nothing is written in either case. A revision
    /// above [`MAX_WRITE_REVISION`](crate::posting::MAX_WRITE_REVISION) is
    /// an [`Error::InvalidArgument`].
    pub fn put(
        &self,
        accessor: &mut Accessor,
        key: &[u8],
        hash: u64,
        value: Option<&[u8]>,
        revision: u64,
    ) -> Result<Option<Value>> {
        validate_key(key)?;
        validate_write_revision(revision)?;
        let lock = Arc::clone(accessor.write_lock());
        let _guard = lock.lock(self.options.lock_wait_timeout_duration())?;

        let result = self.put_locked(accessor, key, hash, value, revision);
        if result.is_ok() {
            accessor.flush_writes()?;
        }
        result
    }

    fn put_locked(
        &self,
        accessor: &mut Accessor,
        key: &[u8],
        hash: u64,
        value: Option<&[u8]>,
        revision: u64,
    ) -> Result<Option<Value>> {
        accessor.check_fits::<Keys>(KeyPosting::size_for(key.len()))?;
        let value_location = match value {
            Some(bytes) if !bytes.is_empty() => {
                let size = ValuePosting::size_for(bytes.len());
                let location = accessor.request_write::<Values>(size)?;
                let posting = ValuePosting::new(revision, Bytes::copy_from_slice(bytes));
                accessor.write::<Values>(location, &posting)?;
                Some(location)
            }
            _ => None,
        };
        let wrote_value = value_location.is_some();

        let mut new_key =
            KeyPosting::new(revision, hash, Bytes::copy_from_slice(key), value_location);

        let (bucket_offset, bucket) = {
            let table = accessor.hashtable()?;
            let offset = table.bucket_offset(hash);
            (offset, table.read_bucket(offset)?)
        };

        if bucket.stamp.flag == Flag::NeverUsed {
            let key_location = append_key(accessor, &new_key)?;
            let hash_code_location =
                self.append_hash_code(accessor, revision, hash, key_location)?;
            accessor
                .hashtable()?
                .write_bucket(bucket_offset, &BucketPosting::new(revision, hash_code_location))?;
            self.count_put(accessor, wrote_value, true)?;
            return Ok(None);
        }

        let mut guard = CycleGuard::new();
        let mut tail = None;
        let mut found = None;
        let mut cursor = bucket.head;
        while let Some(location) = cursor {
            guard.visit(location)?;
            let posting = accessor.read::<HashCodes>(location)?;
            if posting.hash == hash && posting.is_visible(revision) {
                found = Some((location, posting));
                break;
            }
            tail = Some(location);
            cursor = posting.next;
        }

        let Some((hash_code_location, hash_code)) = found else {
            let key_location = append_key(accessor, &new_key)?;
            let appended = self.append_hash_code(accessor, revision, hash, key_location)?;
            match tail {
                Some(last) => accessor.set_link::<HashCodes>(
                    last,
                    HashCodePosting::NEXT_OFFSET,
                    Some(appended),
                )?,
                None => accessor.hashtable()?.set_head(bucket_offset, appended)?,
            }
            if bucket.stamp.flag == Flag::Deleted {
                accessor.hashtable()?.mark_in_use(bucket_offset)?;
            }
            self.count_put(accessor, wrote_value, true)?;
            return Ok(None);
        };

        let scan = scan_key_chain(accessor, hash_code.first_key, key, revision, true)?;
        let Some(current) = scan.target else {
            let key_location = append_key(accessor, &new_key)?;
            relink_previous(accessor, scan.tail, hash_code_location, Some(key_location))?;
            self.count_put(accessor, wrote_value, true)?;
            return Ok(None);
        };

        new_key.next = if self.options.durable_posting_links {
            Some(current.location)
        } else {
            current.posting.next
        };
        let key_location = append_key(accessor, &new_key)?;
        relink_previous(accessor, current.previous, hash_code_location, Some(key_location))?;
        accessor.mark_deleted::<Keys>(current.location, revision)?;
        let old = retire_value(accessor, current.posting.value, revision)?;

        self.count_put(accessor, wrote_value, false)?;
        Ok(Some(old))
    }

    fn append_hash_code(
        &self,
        accessor: &mut Accessor,
        revision: u64,
        hash: u64,
        first_key: Location,
    ) -> Result<Location> {
        let location = accessor.request_write::<HashCodes>(HashCodePosting::FIXED_SIZE as u64)?;
        accessor.write::<HashCodes>(location, &HashCodePosting::new(revision, hash, first_key))?;
        Ok(location)
    }

    fn count_put(&self, accessor: &mut Accessor, wrote_value: bool, new_key: bool) -> Result<()> {
        if !wrote_value && !new_key {
            return Ok(());
        }
        accessor.update_metadata(|meta| {
            if wrote_value {
                meta.value_postings_count += 1;
            }
            if new_key {
                meta.key_count += 1;
            }
        })?;
        Ok(())
    }

    /// Removes `key` at `revision` and returns the value it had.
    ///
    /// With durable posting links, the removed posting is moved to the end
    /// of its chain so earlier revisions can still read through it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchElement`] if the key is not stored at
    /// `revision`, and [`Error::InvalidArgument`] for a revision above
    /// [`MAX_WRITE_REVISION`](crate::posting::MAX_WRITE_REVISION).
    pub fn remove(
        &self,
        accessor: &mut Accessor,
        key: &[u8],
        hash: u64,
        revision: u64,
    ) -> Result<Value> {
        validate_key(key)?;
        validate_write_revision(revision)?;
        let lock = Arc::clone(accessor.write_lock());
        let _guard = lock.lock(self.options.lock_wait_timeout_duration())?;

        let result = self.remove_locked(accessor, key, hash, revision);
        if result.is_ok() {
            accessor.flush_writes()?;
        }
        result
    }

    fn remove_locked(
        &self,
        accessor: &mut Accessor,
        key: &[u8],
        hash: u64,
        revision: u64,
    ) -> Result<Value> {
        let missing = || {
            Error::no_such_element(format!("key of hash {:#x} at revision {}", hash, revision))
        };

        let (bucket_offset, bucket) = {
            let table = accessor.hashtable()?;
            let offset = table.bucket_offset(hash);
            (offset, table.read_bucket(offset)?)
        };
        if !bucket.is_visible(revision) {
            return Err(missing());
        }
        let Some((hash_code_location, hash_code)) =
            find_hash_code(accessor, bucket.head, hash, revision)?
        else {
            return Err(missing());
        };

        let scan = scan_key_chain(accessor, hash_code.first_key, key, revision, false)?;
        let Some(target) = scan.target else {
            return Err(missing());
        };

        if self.options.durable_posting_links {
            if target.posting.next.is_some() {
                let next = target.posting.next;
                relink_previous(accessor, target.previous, hash_code_location, next)?;
                accessor.set_link::<Keys>(target.location, KeyPosting::NEXT_OFFSET, None)?;
                if let Some(tail) = scan.tail {
                    let moved = Some(target.location);
                    accessor.set_link::<Keys>(tail, KeyPosting::NEXT_OFFSET, moved)?;
                }
            }
        } else if scan.others_visible {
            relink_previous(accessor, target.previous, hash_code_location, target.posting.next)?;
        }
        accessor.mark_deleted::<Keys>(target.location, revision)?;

        if !scan.others_visible {
            accessor.mark_deleted::<HashCodes>(hash_code_location, revision)?;
            if !self.other_hash_code_visible(accessor, bucket.head, hash_code_location, revision)? {
                accessor.hashtable()?.mark_deleted(bucket_offset, revision)?;
            }
        }

        let old = retire_value(accessor, target.posting.value, revision)?;
        accessor.update_metadata(|meta| meta.key_count = meta.key_count.saturating_sub(1))?;
        Ok(old)
    }

    fn other_hash_code_visible(
        &self,
        accessor: &mut Accessor,
        head: Option<Location>,
        except: Location,
        revision: u64,
    ) -> Result<bool> {
        let mut guard = CycleGuard::new();
        let mut cursor = head;
        while let Some(location) = cursor {
            guard.visit(location)?;
            let posting = accessor.read::<HashCodes>(location)?;
            if location != except && posting.is_visible(revision) {
                return Ok(true);
            }
            cursor = posting.next;
        }
        Ok(false)
    }
}
