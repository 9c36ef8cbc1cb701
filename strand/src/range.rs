//! Byte-range to chunk arithmetic.

use std::fmt;

use crate::blob::CHUNK_SIZE;

/// A stream byte range translated into chunk coordinates.
///
/// Derived from a start offset and a read length; readers never request
/// more than one chunk's worth of data per call, so at most two chunks
/// are ever involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRange {
    pub offset: u64,
    pub read_len: u64,
    pub first_chunk_idx: u64,
    pub last_chunk_idx: u64,
    pub first_chunk_offset: u64,
    pub last_chunk_read_len: u64,
    pub last_chunk_offset: u64,
}

/// Translates `(offset, read_len)` into chunk coordinates.
pub fn get_range(offset: u64, read_len: usize) -> StreamRange {
    let read_len = read_len as u64;
    let chunk_size = CHUNK_SIZE as u64;

    let first_chunk_idx = offset / chunk_size;
    let last_chunk_idx = (offset + read_len) / chunk_size;
    let first_chunk_offset = offset - first_chunk_idx * chunk_size;

    let last_chunk_offset = if first_chunk_idx == last_chunk_idx {
        first_chunk_offset
    } else {
        0
    };
    let last_chunk_read_len = offset + read_len - last_chunk_idx * chunk_size - last_chunk_offset;

    StreamRange {
        offset,
        read_len,
        first_chunk_idx,
        last_chunk_idx,
        first_chunk_offset,
        last_chunk_read_len,
        last_chunk_offset,
    }
}

impl StreamRange {
    /// Returns `(offset_in_chunk, len)` of the slice of chunk `idx`
    /// covered by this range. Zero-length assignments are to be skipped
    /// by readers.
    pub fn byte_range_for_chunk(&self, idx: u64) -> (u64, u64) {
        if idx == self.first_chunk_idx && idx == self.last_chunk_idx {
            (self.first_chunk_offset, self.last_chunk_read_len)
        } else if idx == self.first_chunk_idx && idx < self.last_chunk_idx {
            (
                self.first_chunk_offset,
                CHUNK_SIZE as u64 - self.first_chunk_offset,
            )
        } else if idx == self.last_chunk_idx && idx > self.first_chunk_idx {
            (0, self.last_chunk_read_len)
        } else {
            (0, 0)
        }
    }
}

impl fmt::Display for StreamRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "B{}[{}:]-B{}[{}:{}]",
            self.first_chunk_idx,
            self.first_chunk_offset,
            self.last_chunk_idx,
            self.last_chunk_offset,
            self.last_chunk_read_len
        )
    }
}
