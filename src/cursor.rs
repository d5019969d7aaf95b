//! Full scan over key postings.

use crate::accessor::Accessor;
use crate::error::Result;
use crate::partition::{Keys, HEADER_REGION_SIZE};
use crate::posting::{Flag, KeyPosting, Posting};

/// A forward-only scan over every key posting visible at one revision.
///
/// The scan position lives in the cursor, so any accessor can drive it
/// and a cursor that reached the end resumes from there once more keys
/// are written. Each call is `O(postings skipped)`; deleted postings are
/// still read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysCursor {
    revision: u64,
    partition: u32,
    offset: u32,
}

impl KeysCursor {
    /// Create a cursor at the start of the first keys partition
    pub fn new(revision: u64) -> Self {
        Self { revision, partition: 0, offset: HEADER_REGION_SIZE }
    }

    /// Revision the cursor reads at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Returns the next visible key posting, or `None` at the end of the
    /// newest keys partition.
    pub fn next(&mut self, accessor: &mut Accessor) -> Result<Option<KeyPosting>> {
        loop {
            let Some(file) = accessor.partition::<Keys>(self.partition)? else {
                return Ok(None);
            };
            let header = file.read_header()?;
            let at_frontier = self.offset >= header.next_posting_offset
                || file.read_flag(self.offset)? == Flag::NeverUsed;

            if at_frontier {
                if accessor.partition::<Keys>(self.partition + 1)?.is_none() {
                    return Ok(None);
                }
                self.partition += 1;
                self.offset = HEADER_REGION_SIZE;
                continue;
            }

            let posting = file.read_posting(self.offset)?;
            self.offset += posting.encoded_len();
            if posting.is_visible(self.revision) {
                return Ok(Some(posting));
            }
        }
    }

    /// Adapts the cursor into an iterator driven by `accessor`.
    pub fn iter(self, accessor: &mut Accessor) -> KeysIter<'_> {
        KeysIter { cursor: self, accessor, done: false }
    }
}

/// Iterator over a [`KeysCursor`]. Stops after the first error.
#[derive(Debug)]
pub struct KeysIter<'a> {
    cursor: KeysCursor,
    accessor: &'a mut Accessor,
    done: bool,
}

impl KeysIter<'_> {
    /// Returns the underlying cursor, positioned after the last yielded posting.
    pub fn into_cursor(self) -> KeysCursor {
        self.cursor
    }
}

impl Iterator for KeysIter<'_> {
    type Item = Result<KeyPosting>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.next(self.accessor) {
            Ok(Some(posting)) => Some(Ok(posting)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
