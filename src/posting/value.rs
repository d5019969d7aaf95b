//! Value posting.
//!
//! Format:
//! ```text
//! [stamp: 17 bytes][len: 4 bytes][value bytes: len bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Posting, Stamp, STAMP_SIZE};
use crate::error::{Error, Result};

/// Terminal blob holding one stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePosting {
    /// Lifecycle stamp.
    pub stamp: Stamp,
    /// Value bytes.
    pub value: Bytes,
}

impl ValuePosting {
    /// Create a live value posting
    pub fn new(revision: u64, value: Bytes) -> Self {
        Self { stamp: Stamp::new(revision), value }
    }

    /// Encoded size of a value posting holding `value_len` bytes.
    pub fn size_for(value_len: usize) -> u64 {
        Self::FIXED_SIZE as u64 + value_len as u64
    }
}

impl Posting for ValuePosting {
    const FIXED_SIZE: u32 = STAMP_SIZE + 4;

    fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);
    }

    fn decode_body(stamp: Stamp, buf: &mut &[u8]) -> Result<Self> {
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(Error::inconsistency(format!(
                "value posting truncated: expected {} bytes, got {}",
                len,
                buf.remaining()
            )));
        }
        let value = buf.copy_to_bytes(len);
        Ok(Self { stamp, value })
    }

    fn variable_len(fixed: &[u8]) -> u32 {
        let mut len = &fixed[STAMP_SIZE as usize..Self::FIXED_SIZE as usize];
        len.get_u32_le()
    }

    fn encoded_len(&self) -> u32 {
        Self::FIXED_SIZE + self.value.len() as u32
    }
}
