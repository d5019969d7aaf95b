//! Posting records.
//!
//! A posting is one append-only binary record. Every posting starts with the
//! same 17-byte stamp:
//!
//! ```text
//! [flag: 1 byte][created: 8 bytes][deleted: 8 bytes, -1 = none]
//! ```
//!
//! followed by a layout specific to its partition kind. Once written, a
//! posting is never rewritten as a whole; only named partial writes (flag and
//! deletion stamp, or a single link field) patch it in place.

mod bucket;
mod hash_code;
mod key;
mod value;

pub use bucket::BucketPosting;
pub use hash_code::HashCodePosting;
pub use key::KeyPosting;
pub use value::ValuePosting;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Size of the stamp shared by all postings.
pub const STAMP_SIZE: u32 = 17;

/// Byte offset of the flag within a posting.
pub const FLAG_OFFSET: u32 = 0;

/// Byte offset of the creation revision within a posting.
pub const CREATED_OFFSET: u32 = 1;

/// Byte offset of the deletion revision within a posting.
pub const DELETED_OFFSET: u32 = 9;

/// Size of an encoded [`Location`].
pub const LOCATION_SIZE: u32 = 8;

const NO_DELETION: i64 = -1;

/// Largest revision a posting can be created or deleted at. The deletion
/// revision is stored signed, with -1 meaning "not deleted".
pub const MAX_WRITE_REVISION: u64 = i64::MAX as u64;

/// Lifecycle flag of a posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    /// Never written. Freshly formatted files read as this.
    NeverUsed = 0,
    /// Live since its creation revision.
    InUse = 1,
    /// Deleted at its deletion revision.
    Deleted = 2,
}

impl Flag {
    /// Decodes a flag byte. Any other value means the file is corrupt.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Flag::NeverUsed),
            1 => Ok(Flag::InUse),
            2 => Ok(Flag::Deleted),
            other => Err(Error::inconsistency(format!("unknown posting flag {:#04x}", other))),
        }
    }
}

/// A durable pointer into a partition of a specific kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// Partition id.
    pub partition: u32,
    /// Byte offset within the partition file.
    pub offset: u32,
}

impl Location {
    const NULL_WORD: u32 = u32::MAX;

    /// Create a new Location
    pub fn new(partition: u32, offset: u32) -> Self {
        Self { partition, offset }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Encodes an optional location. `None` is written as `u32::MAX` twice.
pub fn put_location(buf: &mut impl BufMut, location: Option<Location>) {
    match location {
        Some(loc) => {
            buf.put_u32_le(loc.partition);
            buf.put_u32_le(loc.offset);
        }
        None => {
            buf.put_u32_le(Location::NULL_WORD);
            buf.put_u32_le(Location::NULL_WORD);
        }
    }
}

/// Decodes an optional location.
pub fn get_location(buf: &mut impl Buf) -> Option<Location> {
    let partition = buf.get_u32_le();
    let offset = buf.get_u32_le();
    if partition == Location::NULL_WORD && offset == Location::NULL_WORD {
        None
    } else {
        Some(Location::new(partition, offset))
    }
}

/// Lifecycle flag and revision window of a posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    /// Lifecycle flag.
    pub flag: Flag,
    /// Revision the posting became visible at.
    pub created: u64,
    /// Revision the posting stopped being visible at.
    pub deleted: Option<u64>,
}

impl Stamp {
    /// A live stamp created at `revision`.
    pub fn new(revision: u64) -> Self {
        Self { flag: Flag::InUse, created: revision, deleted: None }
    }

    /// The flag this posting had as of revision `revision`.
    ///
    /// Visibility is the half-open window `[created, deleted)`.
    pub fn flag_for_revision(&self, revision: u64) -> Flag {
        match self.flag {
            Flag::NeverUsed => Flag::NeverUsed,
            _ if self.created > revision => Flag::NeverUsed,
            Flag::InUse => Flag::InUse,
            Flag::Deleted => match self.deleted {
                Some(deleted) if deleted <= revision => Flag::Deleted,
                _ => Flag::InUse,
            },
        }
    }

    /// Whether the posting is live as of `revision`.
    pub fn is_visible(&self, revision: u64) -> bool {
        self.flag_for_revision(revision) == Flag::InUse
    }

    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flag as u8);
        buf.put_u64_le(self.created);
        buf.put_i64_le(encode_deleted(self.deleted));
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < STAMP_SIZE as usize {
            return Err(Error::inconsistency("posting stamp truncated"));
        }
        let flag = Flag::from_byte(buf.get_u8())?;
        let created = buf.get_u64_le();
        let deleted = buf.get_i64_le();
        let deleted = if deleted < 0 { None } else { Some(deleted as u64) };
        Ok(Self { flag, created, deleted })
    }
}

pub(crate) fn encode_deleted(deleted: Option<u64>) -> i64 {
    debug_assert!(deleted.map_or(true, |r| r <= MAX_WRITE_REVISION));
    deleted.map(|r| r as i64).unwrap_or(NO_DELETION)
}

/// Binary codec of one posting kind.
///
/// A posting is `FIXED_SIZE` bytes, followed by `variable_len` bytes for
/// the kinds that carry a payload.
pub trait Posting: Sized {
    /// Size of the fixed part, stamp included.
    const FIXED_SIZE: u32;

    /// The stamp of this posting.
    fn stamp(&self) -> &Stamp;

    /// Appends the fields that follow the stamp.
    fn encode_body(&self, buf: &mut BytesMut);

    /// Decodes the fields that follow the stamp. `buf` holds the whole
    /// posting minus the stamp.
    fn decode_body(stamp: Stamp, buf: &mut &[u8]) -> Result<Self>;

    /// Payload length, read from an encoded fixed part.
    fn variable_len(_fixed: &[u8]) -> u32 {
        0
    }

    /// Encoded size of this posting.
    fn encoded_len(&self) -> u32 {
        Self::FIXED_SIZE
    }

    /// Encode the posting to bytes
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len() as usize);
        self.stamp().encode(&mut buf);
        self.encode_body(&mut buf);
        debug_assert_eq!(buf.len(), self.encoded_len() as usize);
        buf
    }

    /// Decode a posting from bytes
    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE as usize {
            return Err(Error::inconsistency(format!(
                "posting truncated: expected at least {} bytes, got {}",
                Self::FIXED_SIZE,
                data.len()
            )));
        }
        let mut buf = data;
        let stamp = Stamp::decode(&mut buf)?;
        Self::decode_body(stamp, &mut buf)
    }

    /// The flag this posting had as of `revision`.
    fn flag_for_revision(&self, revision: u64) -> Flag {
        self.stamp().flag_for_revision(revision)
    }

    /// Whether the posting is live as of `revision`.
    fn is_visible(&self, revision: u64) -> bool {
        self.stamp().is_visible(revision)
    }
}

/// Detects cycles while walking a posting chain.
///
/// Uses Brent's algorithm: a location is remembered at every power of two
/// steps, and meeting it again means the chain loops.
#[derive(Debug)]
pub struct CycleGuard {
    anchor: Option<Location>,
    power: u64,
    steps: u64,
}

impl CycleGuard {
    /// Create a guard for a new chain walk
    pub fn new() -> Self {
        Self { anchor: None, power: 1, steps: 0 }
    }

    /// Records a step onto `location`.
    ///
    /// # Errors
    ///
    /// Returns a store inconsistency if the walk has entered a cycle.
    pub fn visit(&mut self, location: Location) -> Result<()> {
        if self.anchor == Some(location) {
            return Err(Error::inconsistency(format!("cycle in posting chain at {}", location)));
        }
        self.steps += 1;
        if self.steps == self.power {
            self.anchor = Some(location);
            self.power *= 2;
            self.steps = 0;
        }
        Ok(())
    }
}

impl Default for CycleGuard {
    fn default() -> Self {
        Self::new()
    }
}
