//! Hashtable generation file.
//!
//! A fixed array of [`BucketPosting`] slots after the header region. The
//! slot of a hash code is `hash & (capacity - 1)`.
//!
//! Header format:
//! ```text
//! [magic: 4 bytes][capacity: 4 bytes]
//! ```

use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use super::{FileHeader, FileKind, PostingFile, HEADER_REGION_SIZE};
use crate::error::{Error, Result};
use crate::posting::{BucketPosting, Location, Posting};

/// Magic number of hashtable files.
pub const HASHTABLE_MAGIC: u32 = 0x4854_424C;

/// Largest capacity whose slots are still addressable by a 32-bit offset.
pub const MAX_CAPACITY: u32 = 1 << 27;

/// Hashtable files.
#[derive(Debug)]
pub struct Buckets;

impl FileKind for Buckets {
    const SUFFIX: &'static str = "ht";
    const NAME: &'static str = "hashtable";
    type Header = HashtableHeader;
    type Posting = BucketPosting;
}

/// Header of a hashtable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashtableHeader {
    /// Number of buckets. Always a power of two.
    pub capacity: u32,
}

impl FileHeader for HashtableHeader {
    const SIZE: usize = 8;

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(HASHTABLE_MAGIC);
        buf.put_u32_le(self.capacity);
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::inconsistency("hashtable header truncated"));
        }
        let mut buf = data;
        let magic = buf.get_u32_le();
        if magic != HASHTABLE_MAGIC {
            return Err(Error::inconsistency(format!(
                "Invalid hashtable magic number: expected {:#x}, got {:#x}",
                HASHTABLE_MAGIC, magic
            )));
        }
        let capacity = buf.get_u32_le();
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::inconsistency(format!(
                "hashtable capacity {} is not a power of two",
                capacity
            )));
        }
        Ok(Self { capacity })
    }
}

/// One open hashtable generation.
#[derive(Debug)]
pub struct Hashtable {
    capacity: u32,
    file: PostingFile<Buckets>,
}

impl Hashtable {
    /// Formats hashtable generation `id` with `capacity` buckets.
    pub fn create(dir: &Path, id: u32, capacity: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_CAPACITY {
            return Err(Error::invalid_argument(format!(
                "hashtable capacity must be a power of two no larger than {}, got {}",
                MAX_CAPACITY, capacity
            )));
        }
        let size =
            HEADER_REGION_SIZE as u64 + capacity as u64 * BucketPosting::FIXED_SIZE as u64;
        let file = PostingFile::format(dir, id, size, &HashtableHeader { capacity })?;
        Ok(Self { capacity, file })
    }

    /// Opens hashtable generation `id`, or returns `None` if it does not exist.
    pub fn open(dir: &Path, id: u32) -> Result<Option<Self>> {
        let Some(mut file) = PostingFile::<Buckets>::open(dir, id)? else {
            return Ok(None);
        };
        let header = file.read_header()?;
        let expected =
            HEADER_REGION_SIZE as u64 + header.capacity as u64 * BucketPosting::FIXED_SIZE as u64;
        if file.len() < expected {
            return Err(Error::inconsistency(format!(
                "hashtable {} is {} bytes, expected {} for {} buckets",
                id,
                file.len(),
                expected,
                header.capacity
            )));
        }
        Ok(Some(Self { capacity: header.capacity, file }))
    }

    /// Generation id.
    pub fn id(&self) -> u32 {
        self.file.id()
    }

    /// Number of buckets.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Offset of the bucket slot for `hash`.
    pub fn bucket_offset(&self, hash: u64) -> u32 {
        let index = (hash & (self.capacity as u64 - 1)) as u32;
        HEADER_REGION_SIZE + index * BucketPosting::FIXED_SIZE
    }

    /// Reads the bucket at `offset`.
    pub fn read_bucket(&mut self, offset: u32) -> Result<BucketPosting> {
        self.file.read_posting(offset)
    }

    /// Writes a whole bucket at `offset`.
    pub fn write_bucket(&mut self, offset: u32, bucket: &BucketPosting) -> Result<()> {
        self.file.write_posting(offset, bucket)
    }

    /// Points the bucket at `offset` to a new chain head.
    pub fn set_head(&mut self, offset: u32, head: Location) -> Result<()> {
        self.file.set_location(offset, BucketPosting::HEAD_OFFSET, Some(head))
    }

    /// Flags the bucket at `offset` as deleted at `revision`.
    pub fn mark_deleted(&mut self, offset: u32, revision: u64) -> Result<()> {
        self.file.mark_deleted(offset, revision)
    }

    /// Revives a deleted bucket.
    pub fn mark_in_use(&mut self, offset: u32) -> Result<()> {
        self.file.mark_in_use(offset)
    }

    /// Flushes pending writes.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }
}
