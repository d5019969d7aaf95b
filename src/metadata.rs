//! Store metadata file.
//!
//! A single header record at the start of `00000000.md`:
//!
//! ```text
//! [magic: 4 bytes]
//! [format_version: 4 bytes]
//! [store_revision: 8 bytes]
//! [hashtable_id: 4 bytes]
//! [current_hash_codes: 4 bytes]
//! [current_keys: 4 bytes]
//! [current_values: 4 bytes]
//! [value_postings_count: 8 bytes]
//! [hash_codes_generation_start: 4 bytes]
//! [key_count: 8 bytes]
//! [crc32: 4 bytes]  crc of all preceding bytes
//! ```
//!
//! The header is read with a single positioned read and validated by its
//! checksum, so a reader racing a writer sees either a whole header or a
//! [`Error::ChecksumMismatch`].

use std::fs;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::partition::{file_name, DataFile, HEADER_REGION_SIZE};

/// Magic number of metadata files.
pub const METADATA_MAGIC: u32 = 0x5256_4B56;

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

const READ_ATTEMPTS: u32 = 3;

const METADATA_SUFFIX: &str = "md";

/// Store-wide bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    /// On-disk format version.
    pub format_version: u32,
    /// Latest committed revision.
    pub store_revision: u64,
    /// Current hashtable generation.
    pub hashtable_id: u32,
    /// Hash codes partition receiving appends.
    pub current_hash_codes: u32,
    /// Keys partition receiving appends.
    pub current_keys: u32,
    /// Values partition receiving appends.
    pub current_values: u32,
    /// Number of value postings ever written.
    pub value_postings_count: u64,
    /// First hash codes partition of the current hashtable generation.
    pub hash_codes_generation_start: u32,
    /// Number of live keys.
    pub key_count: u64,
}

impl MetadataHeader {
    /// Encoded size, checksum included.
    pub const SIZE: usize = 56;

    /// Header of a freshly bootstrapped store.
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            store_revision: 0,
            hashtable_id: 0,
            current_hash_codes: 0,
            current_keys: 0,
            current_values: 0,
            value_postings_count: 0,
            hash_codes_generation_start: 0,
            key_count: 0,
        }
    }

    /// Encode the header to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(METADATA_MAGIC);
        buf.put_u32_le(self.format_version);
        buf.put_u64_le(self.store_revision);
        buf.put_u32_le(self.hashtable_id);
        buf.put_u32_le(self.current_hash_codes);
        buf.put_u32_le(self.current_keys);
        buf.put_u32_le(self.current_values);
        buf.put_u64_le(self.value_postings_count);
        buf.put_u32_le(self.hash_codes_generation_start);
        buf.put_u64_le(self.key_count);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Decode the header from bytes, verifying magic and checksum.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::inconsistency(format!(
                "metadata header truncated: expected {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }
        let body = &data[..Self::SIZE - 4];
        let mut stored = &data[Self::SIZE - 4..Self::SIZE];
        let expected = stored.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let mut buf = body;
        let magic = buf.get_u32_le();
        if magic != METADATA_MAGIC {
            return Err(Error::inconsistency(format!(
                "Invalid metadata magic number: expected {:#x}, got {:#x}",
                METADATA_MAGIC, magic
            )));
        }
        let format_version = buf.get_u32_le();
        if format_version != FORMAT_VERSION {
            return Err(Error::inconsistency(format!(
                "unsupported format version {}",
                format_version
            )));
        }
        Ok(Self {
            format_version,
            store_revision: buf.get_u64_le(),
            hashtable_id: buf.get_u32_le(),
            current_hash_codes: buf.get_u32_le(),
            current_keys: buf.get_u32_le(),
            current_values: buf.get_u32_le(),
            value_postings_count: buf.get_u64_le(),
            hash_codes_generation_start: buf.get_u32_le(),
            key_count: buf.get_u64_le(),
        })
    }
}

impl Default for MetadataHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// The open metadata file of a store.
#[derive(Debug)]
pub struct MetadataFile {
    data: DataFile,
}

impl MetadataFile {
    /// Path of the metadata file within `dir`.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(file_name(0, METADATA_SUFFIX))
    }

    /// Writes the initial metadata file.
    ///
    /// The header is written to a temporary file and renamed into place, so
    /// the metadata file exists only once it is complete.
    pub fn create(dir: &Path, header: &MetadataHeader) -> Result<Self> {
        let path = Self::path(dir);
        let tmp = path.with_extension("md.tmp");
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        {
            let mut data = DataFile::create(&tmp, HEADER_REGION_SIZE as u64)?;
            data.write_at(0, &header.encode())?;
            data.sync()?;
        }
        fs::rename(&tmp, &path)?;

        let data = DataFile::open(&path)?
            .ok_or_else(|| Error::inconsistency("metadata file vanished after creation"))?;
        Ok(Self { data })
    }

    /// Opens the metadata file, or returns `None` if the store was never
    /// bootstrapped.
    pub fn open(dir: &Path) -> Result<Option<Self>> {
        Ok(DataFile::open(&Self::path(dir))?.map(|data| Self { data }))
    }

    /// Reads and validates the header.
    ///
    /// Readers do not take the write lock, so a read racing a rewrite may
    /// see a torn header. A checksum mismatch is retried a few times before
    /// it is reported.
    pub fn read(&mut self) -> Result<MetadataHeader> {
        let mut buf = [0u8; MetadataHeader::SIZE];
        let mut attempt = 1;
        loop {
            self.data.read_at(0, &mut buf)?;
            match MetadataHeader::decode(&buf) {
                Err(Error::ChecksumMismatch { .. }) if attempt < READ_ATTEMPTS => {
                    log::debug!("Torn metadata read, retrying (attempt {})", attempt);
                    attempt += 1;
                    std::thread::yield_now();
                }
                result => return result,
            }
        }
    }

    /// Rewrites the header.
    pub fn write(&mut self, header: &MetadataHeader) -> Result<()> {
        self.data.write_at(0, &header.encode())
    }

    /// Flushes the header to disk.
    pub fn sync(&self) -> Result<()> {
        self.data.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> MetadataHeader {
        MetadataHeader {
            store_revision: 17,
            hashtable_id: 2,
            current_hash_codes: 3,
            current_keys: 1,
            current_values: 4,
            value_postings_count: 99,
            hash_codes_generation_start: 3,
            key_count: 12,
            ..MetadataHeader::new()
        }
    }

    #[test]
    fn test_header_encoding() {
        let header = sample();
        let encoded = header.encode();
        assert_eq!(encoded.len(), MetadataHeader::SIZE);
        assert_eq!(MetadataHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut encoded = sample().encode();
        encoded[8] ^= 0x01;
        let err = MetadataHeader::decode(&encoded).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_zeroed_header_is_rejected() {
        let zeroed = [0u8; MetadataHeader::SIZE];
        assert!(MetadataHeader::decode(&zeroed).is_err());
    }

    #[test]
    fn test_metadata_file() {
        let dir = TempDir::new().unwrap();
        assert!(MetadataFile::open(dir.path()).unwrap().is_none());

        let mut file = MetadataFile::create(dir.path(), &MetadataHeader::new()).unwrap();
        assert_eq!(file.read().unwrap(), MetadataHeader::new());

        file.write(&sample()).unwrap();
        let mut reopened = MetadataFile::open(dir.path()).unwrap().unwrap();
        assert_eq!(reopened.read().unwrap(), sample());
        assert!(MetadataFile::path(dir.path()).ends_with("00000000.md"));
    }
}
