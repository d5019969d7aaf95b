//! Rehash: rebuild the hashtable and hash code layer at a new capacity.
//!
//! Key and value postings are left untouched; each live hash code posting
//! of the current generation is copied into a fresh hash codes partition
//! and linked into a fresh hashtable, still pointing at its original key
//! chain. Deleted hash code postings are not carried over. The old files
//! stay on disk, unreferenced.

use std::fs;
use std::sync::Arc;

use super::Store;
use crate::accessor::Accessor;
use crate::error::{Error, Result};
use crate::partition::hashtable::MAX_CAPACITY;
use crate::partition::{Buckets, HashCodes, Hashtable, PostingFile, HEADER_REGION_SIZE};
use crate::posting::{
    BucketPosting, CycleGuard, Flag, HashCodePosting, Location, Posting, Stamp,
};

impl Store {
    /// Rebuilds the hash layer with `resolution` buckets, rounded up to a
    /// power of two.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a zero resolution or one
    /// larger than the maximum hashtable capacity.
    pub fn rehash(&self, accessor: &mut Accessor, resolution: u32) -> Result<()> {
        if resolution == 0 {
            return Err(Error::invalid_argument("rehash resolution must be > 0"));
        }
        let capacity = resolution
            .checked_next_power_of_two()
            .filter(|capacity| *capacity <= MAX_CAPACITY)
            .ok_or_else(|| {
                Error::invalid_argument(format!("rehash resolution {} too large", resolution))
            })?;

        let lock = Arc::clone(accessor.write_lock());
        let _guard = lock.lock(self.options.lock_wait_timeout_duration())?;

        let meta = accessor.metadata()?;
        let first = meta.hash_codes_generation_start;
        let last = meta.current_hash_codes;
        let new_table_id = meta.hashtable_id + 1;
        let new_partition = last + 1;
        log::info!(
            "Rehashing to {} buckets (hashtable generation {}, hash codes partitions {}..={})",
            capacity,
            new_table_id,
            first,
            last
        );

        let stale = PostingFile::<Buckets>::path(accessor.dir(), new_table_id);
        if stale.exists() {
            log::warn!(
                "Removing unreferenced hashtable {} from an interrupted rehash",
                stale.display()
            );
            fs::remove_file(&stale)?;
        }
        let mut table = Hashtable::create(accessor.dir(), new_table_id, capacity)?;
        accessor.update_metadata(|m| m.current_hash_codes = new_partition)?;

        let mut copied = 0u64;
        for id in first..=last {
            copied += self.rehash_partition(accessor, &mut table, id)?;
        }

        if self.options.sync_writes {
            table.sync()?;
            accessor.sync()?;
        }
        accessor.update_metadata(|m| {
            m.hashtable_id = new_table_id;
            m.hash_codes_generation_start = new_partition;
        })?;
        accessor.flush_writes()?;

        log::info!(
            "Rehash finished: {} hash codes moved to hashtable generation {}",
            copied,
            new_table_id
        );
        Ok(())
    }

    /// Copies every live hash code posting of partition `id` into `table`.
    ///
    /// Postings no longer linked from the current hashtable are left behind;
    /// these are copies written by a rehash that did not finish.
    fn rehash_partition(
        &self,
        accessor: &mut Accessor,
        table: &mut Hashtable,
        id: u32,
    ) -> Result<u64> {
        let Some(file) = accessor.partition::<HashCodes>(id)? else {
            return Ok(0);
        };
        let frontier = file.read_header()?.next_posting_offset;

        let mut copied = 0;
        let mut offset = HEADER_REGION_SIZE;
        while offset < frontier {
            let Some(file) = accessor.partition::<HashCodes>(id)? else {
                break;
            };
            let posting = file.read_posting(offset)?;
            match posting.stamp.flag {
                Flag::NeverUsed => break,
                Flag::Deleted => {}
                Flag::InUse => {
                    let location = Location::new(id, offset);
                    if !linked_in_current_table(accessor, location, posting.hash)? {
                        log::debug!("Skipping unlinked hash code posting at {}", location);
                    } else if self.reinsert(accessor, table, &posting)? {
                        copied += 1;
                    }
                }
            }
            offset += HashCodePosting::FIXED_SIZE;
        }
        Ok(copied)
    }

    /// Links a copy of `original` into `table`. Returns false if the table
    /// already holds a live posting for the same hash.
    fn reinsert(
        &self,
        accessor: &mut Accessor,
        table: &mut Hashtable,
        original: &HashCodePosting,
    ) -> Result<bool> {
        let offset = table.bucket_offset(original.hash);
        let bucket = table.read_bucket(offset)?;

        let mut tail = None;
        if bucket.stamp.flag != Flag::NeverUsed {
            let mut guard = CycleGuard::new();
            let mut cursor = bucket.head;
            while let Some(location) = cursor {
                guard.visit(location)?;
                let posting = accessor.read::<HashCodes>(location)?;
                if posting.hash == original.hash {
                    log::warn!(
                        "Skipping duplicate live hash code {:#x} during rehash",
                        original.hash
                    );
                    return Ok(false);
                }
                tail = Some(location);
                cursor = posting.next;
            }
        }

        let copy = HashCodePosting {
            stamp: Stamp::new(original.stamp.created),
            hash: original.hash,
            next: None,
            first_key: original.first_key,
        };
        let location = accessor.request_write::<HashCodes>(HashCodePosting::FIXED_SIZE as u64)?;
        accessor.write::<HashCodes>(location, &copy)?;

        match tail {
            None => {
                table.write_bucket(offset, &BucketPosting::new(copy.stamp.created, location))?;
            }
            Some(last) => {
                accessor.set_link::<HashCodes>(last, HashCodePosting::NEXT_OFFSET, Some(location))?;
                if copy.stamp.created < bucket.stamp.created {
                    let earlier =
                        BucketPosting { stamp: Stamp::new(copy.stamp.created), head: bucket.head };
                    table.write_bucket(offset, &earlier)?;
                }
            }
        }
        Ok(true)
    }
}

/// Returns true if `location` is on the bucket chain of `hash` in the
/// current hashtable generation.
fn linked_in_current_table(
    accessor: &mut Accessor,
    location: Location,
    hash: u64,
) -> Result<bool> {
    let bucket = {
        let table = accessor.hashtable()?;
        table.read_bucket(table.bucket_offset(hash))?
    };
    if bucket.stamp.flag == Flag::NeverUsed {
        return Ok(false);
    }
    let mut guard = CycleGuard::new();
    let mut cursor = bucket.head;
    while let Some(at) = cursor {
        guard.visit(at)?;
        if at == location {
            return Ok(true);
        }
        cursor = accessor.read::<HashCodes>(at)?.next;
    }
    Ok(false)
}
