//! Partition files.
//!
//! Every store file reserves a fixed header region, followed by a flat
//! sequence of postings of a single kind. The hash codes, keys and values
//! partitions are append-only and carry an [`AppendHeader`]; the hashtable
//! is a fixed slot array (see [`hashtable`]).
//!
//! File names are `{id:08}.{suffix}`.

mod file;
pub mod hashtable;

pub use file::{DataFile, PostingFile};
pub use hashtable::{Buckets, Hashtable, HashtableHeader};

use bytes::{Buf, BufMut, BytesMut};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::metadata::MetadataHeader;
use crate::posting::{HashCodePosting, KeyPosting, Posting, ValuePosting};

/// Size of the header region at the start of every store file.
pub const HEADER_REGION_SIZE: u32 = 1024;

/// File name of the store file `id` with the given suffix.
pub fn file_name(id: u32, suffix: &str) -> String {
    format!("{:08}.{}", id, suffix)
}

/// Fixed-layout header stored at offset 0 of a file.
pub trait FileHeader: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Encode the header to bytes
    fn encode(&self) -> BytesMut;

    /// Decode the header from bytes
    fn decode(data: &[u8]) -> Result<Self>;
}

/// A kind of store file: its suffix, header and posting codec.
pub trait FileKind {
    /// File name suffix.
    const SUFFIX: &'static str;
    /// Human readable name, used in logs and errors.
    const NAME: &'static str;
    /// Header codec.
    type Header: FileHeader;
    /// Posting codec.
    type Posting: Posting;
}

/// An append-only partition kind. The metadata tracks which partition of
/// each kind currently receives appends.
pub trait AppendKind: FileKind<Header = AppendHeader> {
    /// Configured size of a partition file of this kind.
    fn partition_size(options: &Options) -> u32;

    /// Partition currently receiving appends.
    fn current(meta: &MetadataHeader) -> u32;

    /// Records a new append target.
    fn set_current(meta: &mut MetadataHeader, id: u32);
}

/// Hash codes partitions.
#[derive(Debug)]
pub struct HashCodes;

/// Keys partitions.
#[derive(Debug)]
pub struct Keys;

/// Values partitions.
#[derive(Debug)]
pub struct Values;

impl FileKind for HashCodes {
    const SUFFIX: &'static str = "hc";
    const NAME: &'static str = "hash codes";
    type Header = AppendHeader;
    type Posting = HashCodePosting;
}

impl AppendKind for HashCodes {
    fn partition_size(options: &Options) -> u32 {
        options.hash_codes_partition_size
    }

    fn current(meta: &MetadataHeader) -> u32 {
        meta.current_hash_codes
    }

    fn set_current(meta: &mut MetadataHeader, id: u32) {
        meta.current_hash_codes = id;
    }
}

impl FileKind for Keys {
    const SUFFIX: &'static str = "k";
    const NAME: &'static str = "keys";
    type Header = AppendHeader;
    type Posting = KeyPosting;
}

impl AppendKind for Keys {
    fn partition_size(options: &Options) -> u32 {
        options.keys_partition_size
    }

    fn current(meta: &MetadataHeader) -> u32 {
        meta.current_keys
    }

    fn set_current(meta: &mut MetadataHeader, id: u32) {
        meta.current_keys = id;
    }
}

impl FileKind for Values {
    const SUFFIX: &'static str = "v";
    const NAME: &'static str = "values";
    type Header = AppendHeader;
    type Posting = ValuePosting;
}

impl AppendKind for Values {
    fn partition_size(options: &Options) -> u32 {
        options.values_partition_size
    }

    fn current(meta: &MetadataHeader) -> u32 {
        meta.current_values
    }

    fn set_current(meta: &mut MetadataHeader, id: u32) {
        meta.current_values = id;
    }
}

/// Header of an append-only partition.
///
/// Format:
/// ```text
/// [next_posting_offset: 4 bytes][bytes_left: 4 bytes]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendHeader {
    /// Offset the next posting will be written at.
    pub next_posting_offset: u32,
    /// Free bytes after `next_posting_offset`.
    pub bytes_left: u32,
}

impl AppendHeader {
    /// Header of a freshly formatted partition of `partition_size` bytes.
    pub fn empty(partition_size: u32) -> Self {
        Self {
            next_posting_offset: HEADER_REGION_SIZE,
            bytes_left: partition_size.saturating_sub(HEADER_REGION_SIZE),
        }
    }

    /// Claims `len` bytes, returning the offset they start at, or `None`
    /// if the partition is too full.
    pub fn reserve(&mut self, len: u32) -> Option<u32> {
        if len > self.bytes_left {
            return None;
        }
        let offset = self.next_posting_offset;
        self.next_posting_offset += len;
        self.bytes_left -= len;
        Some(offset)
    }
}

impl FileHeader for AppendHeader {
    const SIZE: usize = 8;

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.next_posting_offset);
        buf.put_u32_le(self.bytes_left);
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::inconsistency("partition header truncated"));
        }
        let mut buf = data;
        let next_posting_offset = buf.get_u32_le();
        let bytes_left = buf.get_u32_le();
        if next_posting_offset < HEADER_REGION_SIZE {
            return Err(Error::inconsistency(format!(
                "partition header points into the header region: {}",
                next_posting_offset
            )));
        }
        Ok(Self { next_posting_offset, bytes_left })
    }
}
