//! Key posting: one node of a hash code's key chain.
//!
//! Format:
//! ```text
//! [stamp: 17 bytes]
//! [hash: 8 bytes]
//! [next: 8 bytes]   -> next key with the same hash, or a superseded version
//! [value: 8 bytes]  -> value posting, null for a null value
//! [len: 4 bytes]
//! [key bytes: len bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{get_location, put_location, Location, Posting, Stamp, STAMP_SIZE};
use crate::error::{Error, Result};

/// A chain node keyed by the exact key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPosting {
    /// Lifecycle stamp.
    pub stamp: Stamp,
    /// Hash code of the key, as supplied by the caller.
    pub hash: u64,
    /// Next key posting of the chain.
    pub next: Option<Location>,
    /// Value posting, `None` for a null value.
    pub value: Option<Location>,
    /// Key bytes.
    pub key: Bytes,
}

impl KeyPosting {
    /// Byte offset of the next link.
    pub const NEXT_OFFSET: u32 = STAMP_SIZE + 8;
    /// Byte offset of the value link.
    pub const VALUE_OFFSET: u32 = STAMP_SIZE + 16;
    const LEN_OFFSET: usize = (STAMP_SIZE + 24) as usize;

    /// Create a live key posting
    pub fn new(revision: u64, hash: u64, key: Bytes, value: Option<Location>) -> Self {
        Self { stamp: Stamp::new(revision), hash, next: None, value, key }
    }

    /// Encoded size of a key posting holding `key_len` bytes.
    pub fn size_for(key_len: usize) -> u64 {
        Self::FIXED_SIZE as u64 + key_len as u64
    }
}

impl Posting for KeyPosting {
    const FIXED_SIZE: u32 = STAMP_SIZE + 28;

    fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.hash);
        put_location(buf, self.next);
        put_location(buf, self.value);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(&self.key);
    }

    fn decode_body(stamp: Stamp, buf: &mut &[u8]) -> Result<Self> {
        let hash = buf.get_u64_le();
        let next = get_location(buf);
        let value = get_location(buf);
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(Error::inconsistency(format!(
                "key posting truncated: expected {} key bytes, got {}",
                len,
                buf.remaining()
            )));
        }
        let key = buf.copy_to_bytes(len);
        Ok(Self { stamp, hash, next, value, key })
    }

    fn variable_len(fixed: &[u8]) -> u32 {
        let mut len = &fixed[Self::LEN_OFFSET..Self::LEN_OFFSET + 4];
        len.get_u32_le()
    }

    fn encoded_len(&self) -> u32 {
        Self::FIXED_SIZE + self.key.len() as u32
    }
}
