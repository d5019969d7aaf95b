//! Generic file driver shared by every posting file kind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use super::{file_name, FileHeader, FileKind};
use crate::error::{Error, Result};
use crate::posting::{
    encode_deleted, put_location, Flag, Location, Posting, DELETED_OFFSET, FLAG_OFFSET,
    MAX_WRITE_REVISION,
};

/// A fixed-size file read and written at explicit offsets.
#[derive(Debug)]
pub struct DataFile {
    file: File,
    path: PathBuf,
    len: u64,
}

impl DataFile {
    /// Creates a new file of `size` bytes, every byte set to the
    /// `NEVER_USED` sentinel (zero).
    ///
    /// # Errors
    ///
    /// Fails if the file already exists.
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        file.set_len(size)?;
        Ok(Self { file, path: path.to_path_buf(), len: size })
    }

    /// Opens an existing file. Returns `None` if it does not exist.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => {
                let len = file.metadata()?.len();
                Ok(Some(Self { file, path: path.to_path_buf(), len }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the file in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.len {
            return Err(Error::inconsistency(format!(
                "access of {} bytes at offset {} past the end of {} ({} bytes)",
                len,
                offset,
                self.path.display(),
                self.len
            )));
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes all of `data` starting at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Flushes file contents to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// A store file holding postings of kind `K`.
#[derive(Debug)]
pub struct PostingFile<K: FileKind> {
    id: u32,
    data: DataFile,
    dirty: bool,
    _kind: PhantomData<K>,
}

impl<K: FileKind> PostingFile<K> {
    /// Path of file `id` of this kind within `dir`.
    pub fn path(dir: &Path, id: u32) -> PathBuf {
        dir.join(file_name(id, K::SUFFIX))
    }

    /// Formats a new file of `size` bytes and writes its header.
    ///
    /// The file is built under a temporary name and renamed into place, so
    /// a reader never opens a partition without its header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if file `id` exists.
    pub fn format(dir: &Path, id: u32, size: u64, header: &K::Header) -> Result<Self> {
        let path = Self::path(dir, id);
        if path.exists() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }
        let tmp = path.with_extension(format!("{}.tmp", K::SUFFIX));
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        {
            let data = DataFile::create(&tmp, size)?;
            let mut staged = Self { id, data, dirty: true, _kind: PhantomData };
            staged.write_header(header)?;
            staged.sync()?;
        }
        fs::rename(&tmp, &path)?;

        let file = Self::open(dir, id)?.ok_or_else(|| {
            Error::inconsistency(format!("{} partition {} vanished after formatting", K::NAME, id))
        })?;
        log::info!("Formatted {} partition {} ({} bytes)", K::NAME, id, size);
        Ok(file)
    }

    /// Opens file `id`, or returns `None` if it was never formatted.
    ///
    /// # Errors
    ///
    /// Returns a store inconsistency if the file header does not decode.
    pub fn open(dir: &Path, id: u32) -> Result<Option<Self>> {
        let Some(data) = DataFile::open(&Self::path(dir, id))? else {
            return Ok(None);
        };
        let mut file = Self { id, data, dirty: false, _kind: PhantomData };
        file.read_header()?;
        Ok(Some(file))
    }

    /// Id of this file.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Size of the file in bytes.
    pub fn len(&self) -> u64 {
        self.data.len()
    }

    /// Returns true if the file is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reads the file header.
    pub fn read_header(&mut self) -> Result<K::Header> {
        let mut buf = vec![0u8; <K::Header as FileHeader>::SIZE];
        self.data.read_at(0, &mut buf)?;
        K::Header::decode(&buf)
    }

    /// Rewrites the file header.
    pub fn write_header(&mut self, header: &K::Header) -> Result<()> {
        self.dirty = true;
        self.data.write_at(0, &header.encode())
    }

    /// Reads the posting at `offset`.
    pub fn read_posting(&mut self, offset: u32) -> Result<K::Posting> {
        let fixed = <K::Posting as Posting>::FIXED_SIZE as usize;
        let mut buf = vec![0u8; fixed];
        self.data.read_at(offset as u64, &mut buf)?;

        let extra = <K::Posting as Posting>::variable_len(&buf) as usize;
        if extra > 0 {
            self.data.check_bounds(offset as u64 + fixed as u64, extra)?;
            buf.resize(fixed + extra, 0);
            self.data.read_at(offset as u64 + fixed as u64, &mut buf[fixed..])?;
        }
        K::Posting::decode(&buf)
    }

    /// Reads only the flag byte of the posting at `offset`.
    pub fn read_flag(&mut self, offset: u32) -> Result<Flag> {
        let mut buf = [0u8; 1];
        self.data.read_at(offset as u64 + FLAG_OFFSET as u64, &mut buf)?;
        Flag::from_byte(buf[0])
    }

    /// Writes a whole posting at `offset`.
    pub fn write_posting(&mut self, offset: u32, posting: &K::Posting) -> Result<()> {
        self.dirty = true;
        self.data.write_at(offset as u64, &posting.encode())
    }

    /// Flags the posting at `offset` as deleted at `revision`.
    ///
    /// Only the deletion revision and the flag byte are written, in that
    /// order, so the flag flip is the last thing a reader can observe.
    pub fn mark_deleted(&mut self, offset: u32, revision: u64) -> Result<()> {
        if revision > MAX_WRITE_REVISION {
            return Err(Error::invalid_argument(format!(
                "deletion revision {} exceeds {}",
                revision, MAX_WRITE_REVISION
            )));
        }
        self.dirty = true;
        let deleted = encode_deleted(Some(revision)).to_le_bytes();
        self.data.write_at(offset as u64 + DELETED_OFFSET as u64, &deleted)?;
        self.data.write_at(offset as u64 + FLAG_OFFSET as u64, &[Flag::Deleted as u8])
    }

    /// Clears the deletion of the posting at `offset`. Its creation
    /// revision is kept.
    pub fn mark_in_use(&mut self, offset: u32) -> Result<()> {
        self.dirty = true;
        self.data.write_at(offset as u64 + FLAG_OFFSET as u64, &[Flag::InUse as u8])?;
        let deleted = encode_deleted(None).to_le_bytes();
        self.data.write_at(offset as u64 + DELETED_OFFSET as u64, &deleted)
    }

    /// Rewrites the single link field at `field_offset` within the posting at `offset`.
    pub fn set_location(
        &mut self,
        offset: u32,
        field_offset: u32,
        location: Option<Location>,
    ) -> Result<()> {
        self.dirty = true;
        let mut buf = Vec::with_capacity(8);
        put_location(&mut buf, location);
        self.data.write_at(offset as u64 + field_offset as u64, &buf)
    }

    /// Flushes the file if anything was written since the last sync.
    pub fn sync(&mut self) -> Result<()> {
        if self.dirty {
            self.data.sync()?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{AppendHeader, Values};
    use crate::posting::ValuePosting;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[test]
    fn test_format_and_reopen() {
        let dir = TempDir::new().unwrap();
        let header = AppendHeader::empty(4096);

        let mut file = PostingFile::<Values>::format(dir.path(), 3, 4096, &header).unwrap();
        assert_eq!(file.id(), 3);
        assert_eq!(file.len(), 4096);
        assert_eq!(file.read_header().unwrap(), header);
        assert!(PostingFile::<Values>::path(dir.path(), 3).ends_with("00000003.v"));

        let mut reopened = PostingFile::<Values>::open(dir.path(), 3).unwrap().unwrap();
        assert_eq!(reopened.read_header().unwrap(), header);
        assert_eq!(reopened.read_flag(1024).unwrap(), Flag::NeverUsed);

        assert!(PostingFile::<Values>::open(dir.path(), 4).unwrap().is_none());
        assert!(PostingFile::<Values>::format(dir.path(), 3, 4096, &header).is_err());
    }

    #[test]
    fn test_format_renames_into_place() {
        let dir = TempDir::new().unwrap();
        let header = AppendHeader::empty(2048);

        // Leftover from a format that did not finish
        let tmp = PostingFile::<Values>::path(dir.path(), 1).with_extension("v.tmp");
        std::fs::write(&tmp, b"junk").unwrap();

        let mut file = PostingFile::<Values>::format(dir.path(), 1, 2048, &header).unwrap();
        assert_eq!(file.read_header().unwrap(), header);
        assert_eq!(file.len(), 2048);
        assert!(!tmp.exists());

        let again = PostingFile::<Values>::format(dir.path(), 1, 2048, &header);
        assert!(matches!(again, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_open_rejects_file_without_header() {
        let dir = TempDir::new().unwrap();
        std::fs::File::create(PostingFile::<Values>::path(dir.path(), 2)).unwrap();
        assert!(PostingFile::<Values>::open(dir.path(), 2).unwrap_err().is_fatal());
    }

    #[test]
    fn test_posting_partial_writes() {
        let dir = TempDir::new().unwrap();
        let mut file =
            PostingFile::<Values>::format(dir.path(), 0, 4096, &AppendHeader::empty(4096))
                .unwrap();

        let posting = ValuePosting::new(2, Bytes::from_static(b"payload"));
        file.write_posting(1024, &posting).unwrap();
        assert_eq!(file.read_posting(1024).unwrap(), posting);

        file.mark_deleted(1024, 5).unwrap();
        let deleted = file.read_posting(1024).unwrap();
        assert_eq!(deleted.stamp.flag, Flag::Deleted);
        assert_eq!(deleted.stamp.created, 2);
        assert_eq!(deleted.stamp.deleted, Some(5));
        assert_eq!(deleted.value, posting.value);

        file.mark_in_use(1024).unwrap();
        assert_eq!(file.read_posting(1024).unwrap(), posting);
    }

    #[test]
    fn test_out_of_bounds_is_inconsistency() {
        let dir = TempDir::new().unwrap();
        let mut file =
            PostingFile::<Values>::format(dir.path(), 0, 2048, &AppendHeader::empty(2048))
                .unwrap();
        let err = file.read_posting(2040).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_corrupt_length_is_inconsistency() {
        let dir = TempDir::new().unwrap();
        let mut file =
            PostingFile::<Values>::format(dir.path(), 0, 2048, &AppendHeader::empty(2048))
                .unwrap();
        let posting = ValuePosting::new(1, Bytes::from_static(b"payload"));
        file.write_posting(1024, &posting).unwrap();

        // Length field right after the stamp
        file.data.write_at(1024 + 17, &u32::MAX.to_le_bytes()).unwrap();
        assert!(file.read_posting(1024).unwrap_err().is_fatal());
    }

    #[test]
    fn test_mark_deleted_rejects_unencodable_revision() {
        let dir = TempDir::new().unwrap();
        let mut file =
            PostingFile::<Values>::format(dir.path(), 0, 2048, &AppendHeader::empty(2048))
                .unwrap();
        let posting = ValuePosting::new(1, Bytes::from_static(b"payload"));
        file.write_posting(1024, &posting).unwrap();

        let err = file.mark_deleted(1024, MAX_WRITE_REVISION + 1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(file.read_posting(1024).unwrap(), posting);

        file.mark_deleted(1024, MAX_WRITE_REVISION).unwrap();
        assert_eq!(file.read_posting(1024).unwrap().stamp.deleted, Some(MAX_WRITE_REVISION));
    }

    #[test]
    fn test_corrupt_flag() {
        let dir = TempDir::new().unwrap();
        let mut file =
            PostingFile::<Values>::format(dir.path(), 0, 2048, &AppendHeader::empty(2048))
                .unwrap();
        file.data.write_at(1024, &[9u8]).unwrap();
        assert!(file.read_flag(1024).unwrap_err().is_fatal());
        assert!(file.read_posting(1024).unwrap_err().is_fatal());
    }
}
