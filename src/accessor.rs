//! Accessor: one session's set of open store files.
//!
//! An accessor owns handles to the metadata file, the current hashtable
//! generation and every partition it has touched. It is not shared between
//! threads; concurrent operations each check one out of the
//! [`AccessorPool`](crate::pool::AccessorPool).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::lock::WriteLock;
use crate::metadata::{MetadataFile, MetadataHeader};
use crate::partition::{
    AppendHeader, AppendKind, Buckets, HashCodes, Hashtable, Keys, PostingFile, Values,
    HEADER_REGION_SIZE,
};
use crate::posting::Location;

/// The open partitions of one kind, by id.
#[derive(Debug)]
pub struct PartitionSet<K: AppendKind> {
    dir: PathBuf,
    partition_size: u32,
    open: HashMap<u32, PostingFile<K>>,
}

impl<K: AppendKind> PartitionSet<K> {
    fn new(dir: &Path, options: &Options) -> Self {
        Self {
            dir: dir.to_path_buf(),
            partition_size: K::partition_size(options),
            open: HashMap::new(),
        }
    }

    /// Returns partition `id`, opening it on first use. `None` if it was
    /// never formatted.
    fn get(&mut self, id: u32) -> Result<Option<&mut PostingFile<K>>> {
        match self.open.entry(id) {
            Entry::Occupied(entry) => Ok(Some(entry.into_mut())),
            Entry::Vacant(entry) => match PostingFile::open(&self.dir, id)? {
                Some(file) => Ok(Some(entry.insert(file))),
                None => Ok(None),
            },
        }
    }

    /// Returns partition `id`, formatting it if it does not exist yet.
    /// The caller must hold the write lock.
    fn get_or_format(&mut self, id: u32) -> Result<&mut PostingFile<K>> {
        match self.open.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let file = match PostingFile::open(&self.dir, id)? {
                    Some(file) => file,
                    None => PostingFile::format(
                        &self.dir,
                        id,
                        self.partition_size as u64,
                        &AppendHeader::empty(self.partition_size),
                    )?,
                };
                Ok(entry.insert(file))
            }
        }
    }

    fn sync(&mut self) -> Result<()> {
        for file in self.open.values_mut() {
            file.sync()?;
        }
        Ok(())
    }
}

/// Selects the [`PartitionSet`] of kind `K` within an accessor.
pub trait Partitions<K: AppendKind> {
    /// The open partitions of kind `K`.
    fn partitions(&mut self) -> &mut PartitionSet<K>;
}

/// A session over the files of one store.
#[derive(Debug)]
pub struct Accessor {
    dir: PathBuf,
    options: Arc<Options>,
    lock: Arc<WriteLock>,
    metadata: MetadataFile,
    hashtable: Option<Hashtable>,
    hash_codes: PartitionSet<HashCodes>,
    keys: PartitionSet<Keys>,
    values: PartitionSet<Values>,
}

impl Partitions<HashCodes> for Accessor {
    fn partitions(&mut self) -> &mut PartitionSet<HashCodes> {
        &mut self.hash_codes
    }
}

impl Partitions<Keys> for Accessor {
    fn partitions(&mut self) -> &mut PartitionSet<Keys> {
        &mut self.keys
    }
}

impl Partitions<Values> for Accessor {
    fn partitions(&mut self) -> &mut PartitionSet<Values> {
        &mut self.values
    }
}

impl Accessor {
    /// Opens an accessor over the store in `dir`.
    ///
    /// If the store has never been bootstrapped, the hashtable, the first
    /// partition of each kind and finally the metadata file are created
    /// under the write lock.
    pub fn open(dir: &Path, options: Arc<Options>, lock: Arc<WriteLock>) -> Result<Self> {
        let metadata = match MetadataFile::open(dir)? {
            Some(metadata) => metadata,
            None => lock.with(options.lock_wait_timeout_duration(), || {
                match MetadataFile::open(dir)? {
                    Some(metadata) => Ok(metadata),
                    None => bootstrap(dir, &options),
                }
            })?,
        };
        log::debug!("Opened accessor on {}", dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            hash_codes: PartitionSet::new(dir, &options),
            keys: PartitionSet::new(dir, &options),
            values: PartitionSet::new(dir, &options),
            options,
            lock,
            metadata,
            hashtable: None,
        })
    }

    /// Data directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The store write lock.
    pub fn write_lock(&self) -> &Arc<WriteLock> {
        &self.lock
    }

    /// Reads the current metadata header.
    pub fn metadata(&mut self) -> Result<MetadataHeader> {
        self.metadata.read()
    }

    /// Read-modify-writes the metadata header under the write lock.
    pub fn update_metadata<F>(&mut self, f: F) -> Result<MetadataHeader>
    where
        F: FnOnce(&mut MetadataHeader),
    {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock(self.options.lock_wait_timeout_duration())?;
        let mut header = self.metadata.read()?;
        f(&mut header);
        self.metadata.write(&header)?;
        Ok(header)
    }

    /// Latest committed store revision.
    pub fn store_revision(&mut self) -> Result<u64> {
        Ok(self.metadata.read()?.store_revision)
    }

    /// Advances the store revision by one and returns the new revision.
    pub fn increase_store_revision(&mut self) -> Result<u64> {
        let header = self.update_metadata(|m| m.store_revision += 1)?;
        if self.options.sync_writes {
            self.metadata.sync()?;
        }
        Ok(header.store_revision)
    }

    /// The current hashtable generation. Reopened transparently when a
    /// rehash has switched generations since the last call.
    pub fn hashtable(&mut self) -> Result<&mut Hashtable> {
        let id = self.metadata.read()?.hashtable_id;
        let stale = self.hashtable.as_ref().map_or(true, |table| table.id() != id);
        if stale {
            let table = Hashtable::open(&self.dir, id)?.ok_or_else(|| {
                Error::inconsistency(format!("hashtable generation {} is missing", id))
            })?;
            log::debug!("Accessor switched to hashtable generation {}", id);
            self.hashtable = Some(table);
        }
        self.hashtable
            .as_mut()
            .ok_or_else(|| Error::inconsistency("hashtable not loaded"))
    }

    fn set<K: AppendKind>(&mut self) -> &mut PartitionSet<K>
    where
        Self: Partitions<K>,
    {
        <Self as Partitions<K>>::partitions(self)
    }

    /// Partition `id` of kind `K`, or `None` if it does not exist.
    pub fn partition<K: AppendKind>(&mut self, id: u32) -> Result<Option<&mut PostingFile<K>>>
    where
        Self: Partitions<K>,
    {
        self.set::<K>().get(id)
    }

    fn existing<K: AppendKind>(&mut self, id: u32) -> Result<&mut PostingFile<K>>
    where
        Self: Partitions<K>,
    {
        self.set::<K>().get(id)?.ok_or_else(|| {
            Error::inconsistency(format!("link into missing {} partition {}", K::NAME, id))
        })
    }

    /// Reads the posting at `location`.
    pub fn read<K: AppendKind>(&mut self, location: Location) -> Result<K::Posting>
    where
        Self: Partitions<K>,
    {
        self.existing::<K>(location.partition)?.read_posting(location.offset)
    }

    /// Writes a whole posting at a reserved `location`.
    pub fn write<K: AppendKind>(&mut self, location: Location, posting: &K::Posting) -> Result<()>
    where
        Self: Partitions<K>,
    {
        self.existing::<K>(location.partition)?.write_posting(location.offset, posting)
    }

    /// Flags the posting at `location` as deleted at `revision`.
    pub fn mark_deleted<K: AppendKind>(&mut self, location: Location, revision: u64) -> Result<()>
    where
        Self: Partitions<K>,
    {
        self.existing::<K>(location.partition)?.mark_deleted(location.offset, revision)
    }

    /// Rewrites one link field of the posting at `location`.
    pub fn set_link<K: AppendKind>(
        &mut self,
        location: Location,
        field_offset: u32,
        target: Option<Location>,
    ) -> Result<()>
    where
        Self: Partitions<K>,
    {
        self.existing::<K>(location.partition)?.set_location(location.offset, field_offset, target)
    }

    /// Reserves `size` bytes in the current append partition of kind `K`.
    ///
    /// Rolls over to a fresh partition when the current one is too full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PostingTooLarge`] if `size` exceeds what an empty
    /// partition can hold.
    pub fn request_write<K: AppendKind>(&mut self, size: u64) -> Result<Location>
    where
        Self: Partitions<K>,
    {
        self.check_fits::<K>(size)?;
        let size = size as u32;

        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock(self.options.lock_wait_timeout_duration())?;

        let mut header = self.metadata.read()?;
        let mut id = K::current(&header);
        loop {
            let file = self.set::<K>().get_or_format(id)?;
            let mut append = file.read_header()?;
            if let Some(offset) = append.reserve(size) {
                file.write_header(&append)?;
                log::trace!(
                    "Reserved {} bytes in {} partition {} at {}",
                    size,
                    K::NAME,
                    id,
                    offset
                );
                return Ok(Location::new(id, offset));
            }

            id += 1;
            self.set::<K>().get_or_format(id)?;
            K::set_current(&mut header, id);
            self.metadata.write(&header)?;
            log::debug!("Rolled {} partition over to {}", K::NAME, id);
        }
    }

    /// Checks that a posting of `size` bytes fits in an empty partition of
    /// kind `K`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PostingTooLarge`] if it does not.
    pub fn check_fits<K: AppendKind>(&self, size: u64) -> Result<()> {
        let capacity = K::partition_size(&self.options).saturating_sub(HEADER_REGION_SIZE);
        if size > capacity as u64 {
            return Err(Error::PostingTooLarge {
                partition: K::NAME,
                size: size.min(u32::MAX as u64) as u32,
                capacity,
            });
        }
        Ok(())
    }

    /// Syncs every touched file when the store is configured for it.
    pub fn flush_writes(&mut self) -> Result<()> {
        if !self.options.sync_writes {
            return Ok(());
        }
        self.sync()
    }

    /// Syncs every touched file.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(table) = self.hashtable.as_mut() {
            table.sync()?;
        }
        self.hash_codes.sync()?;
        self.keys.sync()?;
        self.values.sync()?;
        self.metadata.sync()
    }
}

/// Creates the files of an empty store. The metadata file comes last, so
/// its presence means the bootstrap completed.
fn bootstrap(dir: &Path, options: &Options) -> Result<MetadataFile> {
    log::info!("Bootstrapping new store in {}", dir.display());

    let leftovers = [
        PostingFile::<Buckets>::path(dir, 0),
        PostingFile::<HashCodes>::path(dir, 0),
        PostingFile::<Keys>::path(dir, 0),
        PostingFile::<Values>::path(dir, 0),
    ];
    for path in &leftovers {
        if path.exists() {
            log::warn!("Removing leftover {} from an interrupted bootstrap", path.display());
            fs::remove_file(path)?;
        }
    }

    Hashtable::create(dir, 0, options.initial_capacity.next_power_of_two())?;
    format_first::<HashCodes>(dir, options)?;
    format_first::<Keys>(dir, options)?;
    format_first::<Values>(dir, options)?;

    MetadataFile::create(dir, &MetadataHeader::new())
}

fn format_first<K: AppendKind>(dir: &Path, options: &Options) -> Result<()> {
    let size = K::partition_size(options);
    PostingFile::<K>::format(dir, 0, size as u64, &AppendHeader::empty(size))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::{Flag, ValuePosting};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open(dir: &Path, options: Options) -> Accessor {
        let lock = Arc::new(WriteLock::open(dir, Duration::from_millis(5)).unwrap());
        Accessor::open(dir, Arc::new(options), lock).unwrap()
    }

    #[test]
    fn test_bootstrap() {
        let dir = TempDir::new().unwrap();
        let mut acc = open(dir.path(), Options::default().initial_capacity(64));

        let meta = acc.metadata().unwrap();
        assert_eq!(meta, MetadataHeader::new());
        assert_eq!(acc.hashtable().unwrap().capacity(), 64);
        assert!(acc.partition::<Keys>(0).unwrap().is_some());
        assert!(acc.partition::<Keys>(1).unwrap().is_none());
        assert!(MetadataFile::path(dir.path()).exists());

        // A second accessor sees the same store.
        let mut other = open(dir.path(), Options::default().initial_capacity(1024));
        assert_eq!(other.hashtable().unwrap().capacity(), 64);
    }

    #[test]
    fn test_store_revision() {
        let dir = TempDir::new().unwrap();
        let mut acc = open(dir.path(), Options::default().initial_capacity(16));

        assert_eq!(acc.store_revision().unwrap(), 0);
        assert_eq!(acc.increase_store_revision().unwrap(), 1);
        assert_eq!(acc.increase_store_revision().unwrap(), 2);
        assert_eq!(acc.store_revision().unwrap(), 2);
        assert!(!acc.write_lock().is_held_by_current_thread());
    }

    #[test]
    fn test_request_write_rolls_over() {
        let dir = TempDir::new().unwrap();
        let options = Options::default().initial_capacity(16).values_partition_size(1024 + 100);
        let mut acc = open(dir.path(), options);

        let size = ValuePosting::size_for(20);
        assert_eq!(acc.request_write::<Values>(size).unwrap(), Location::new(0, 1024));
        assert_eq!(acc.request_write::<Values>(size).unwrap(), Location::new(0, 1024 + 41));
        assert_eq!(acc.request_write::<Values>(size).unwrap(), Location::new(1, 1024));
        assert_eq!(acc.metadata().unwrap().current_values, 1);

        let loc = Location::new(1, 1024);
        let posting = ValuePosting::new(1, Bytes::from_static(b"twenty bytes of data"));
        acc.write::<Values>(loc, &posting).unwrap();
        assert_eq!(acc.read::<Values>(loc).unwrap(), posting);

        acc.mark_deleted::<Values>(loc, 4).unwrap();
        assert_eq!(acc.read::<Values>(loc).unwrap().stamp.flag, Flag::Deleted);
    }

    #[test]
    fn test_posting_too_large() {
        let dir = TempDir::new().unwrap();
        let options = Options::default().initial_capacity(16).values_partition_size(2048);
        let mut acc = open(dir.path(), options);

        let err = acc.request_write::<Values>(ValuePosting::size_for(2000)).unwrap_err();
        assert!(matches!(err, Error::PostingTooLarge { partition: "values", capacity: 1024, .. }));
    }

    #[test]
    fn test_link_into_missing_partition() {
        let dir = TempDir::new().unwrap();
        let mut acc = open(dir.path(), Options::default().initial_capacity(16));
        let err = acc.read::<Keys>(Location::new(9, 1024)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_interrupted_bootstrap_is_redone() {
        let dir = TempDir::new().unwrap();
        let options = Options::default().initial_capacity(16);
        format_first::<Keys>(dir.path(), &options).unwrap();

        let mut acc = open(dir.path(), options);
        assert_eq!(acc.metadata().unwrap().key_count, 0);
        assert!(acc.partition::<Keys>(0).unwrap().is_some());
    }
}
