//! Hashtable bucket posting.
//!
//! Format:
//! ```text
//! [stamp: 17 bytes]
//! [head: 8 bytes] -> first hash code posting of the bucket chain
//! ```

use bytes::BytesMut;

use super::{get_location, put_location, Location, Posting, Stamp, STAMP_SIZE};
use crate::error::Result;

/// One slot of a hashtable generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPosting {
    /// Lifecycle stamp.
    pub stamp: Stamp,
    /// Head of the hash code chain.
    pub head: Option<Location>,
}

impl BucketPosting {
    /// Byte offset of the head link.
    pub const HEAD_OFFSET: u32 = STAMP_SIZE;

    /// Create a live bucket created at `revision`
    pub fn new(revision: u64, head: Location) -> Self {
        Self { stamp: Stamp::new(revision), head: Some(head) }
    }
}

impl Posting for BucketPosting {
    const FIXED_SIZE: u32 = STAMP_SIZE + 8;

    fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_location(buf, self.head);
    }

    fn decode_body(stamp: Stamp, buf: &mut &[u8]) -> Result<Self> {
        let head = get_location(buf);
        Ok(Self { stamp, head })
    }
}
