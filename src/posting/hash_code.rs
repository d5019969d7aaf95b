//! Hash code posting: one node of a bucket's collision chain.
//!
//! Format:
//! ```text
//! [stamp: 17 bytes]
//! [hash: 8 bytes]
//! [next: 8 bytes]       -> next hash code posting in the same bucket
//! [first_key: 8 bytes]  -> head of the key chain for this hash
//! ```

use bytes::{Buf, BufMut, BytesMut};

use super::{get_location, put_location, Location, Posting, Stamp, STAMP_SIZE};
use crate::error::Result;

/// A chain node keyed by the full 64-bit hash code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCodePosting {
    /// Lifecycle stamp.
    pub stamp: Stamp,
    /// Full hash code.
    pub hash: u64,
    /// Next hash code posting of the bucket chain.
    pub next: Option<Location>,
    /// First key posting carrying this hash code.
    pub first_key: Option<Location>,
}

impl HashCodePosting {
    /// Byte offset of the next link.
    pub const NEXT_OFFSET: u32 = STAMP_SIZE + 8;
    /// Byte offset of the first key link.
    pub const FIRST_KEY_OFFSET: u32 = STAMP_SIZE + 16;

    /// Create a live hash code posting at the end of its chain
    pub fn new(revision: u64, hash: u64, first_key: Location) -> Self {
        Self { stamp: Stamp::new(revision), hash, next: None, first_key: Some(first_key) }
    }
}

impl Posting for HashCodePosting {
    const FIXED_SIZE: u32 = STAMP_SIZE + 24;

    fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.hash);
        put_location(buf, self.next);
        put_location(buf, self.first_key);
    }

    fn decode_body(stamp: Stamp, buf: &mut &[u8]) -> Result<Self> {
        let hash = buf.get_u64_le();
        let next = get_location(buf);
        let first_key = get_location(buf);
        Ok(Self { stamp, hash, next, first_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_code_layout() {
        let mut posting = HashCodePosting::new(1, 0xDEAD_BEEF_CAFE_F00D, Location::new(0, 1024));
        posting.next = Some(Location::new(3, 4096));

        let encoded = posting.encode();
        assert_eq!(encoded.len(), HashCodePosting::FIXED_SIZE as usize);
        assert_eq!(encoded.len(), 41);

        let next = HashCodePosting::NEXT_OFFSET as usize;
        assert_eq!(&encoded[next..next + 4], &3u32.to_le_bytes());
        let first = HashCodePosting::FIRST_KEY_OFFSET as usize;
        assert_eq!(&encoded[first + 4..first + 8], &1024u32.to_le_bytes());

        assert_eq!(HashCodePosting::decode(&encoded).unwrap(), posting);
    }

    #[test]
    fn test_decode_truncated() {
        let err = HashCodePosting::decode(&[1u8; 30]).unwrap_err();
        assert!(err.is_fatal());
    }
}
