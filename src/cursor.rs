use byteorder::{ByteOrder, LittleEndian};

use crate::error::FormatError;

/// A forward-only reader over a contiguous little-endian byte region.
///
/// Bounds are checked when a read or skip would cross the end of the
/// region, in which case [`FormatError::UnexpectedEof`] is returned.
/// Random access within the same buffer is done by spawning a second
/// cursor with [`ByteCursor::cursor_at`].
#[derive(Clone, Copy)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// The number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// A new cursor over the same buffer, positioned at an absolute offset.
    pub fn cursor_at(&self, offset: usize) -> Result<ByteCursor<'a>, FormatError> {
        if offset > self.buf.len() {
            return Err(FormatError::UnexpectedEof);
        }
        Ok(ByteCursor {
            buf: self.buf,
            pos: offset,
        })
    }

    pub fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        if len > self.remaining() {
            return Err(FormatError::UnexpectedEof);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), FormatError> {
        self.take_bytes(len).map(|_| ())
    }

    pub fn take_u16(&mut self) -> Result<u16, FormatError> {
        Ok(LittleEndian::read_u16(self.take_bytes(2)?))
    }

    pub fn take_u32(&mut self) -> Result<u32, FormatError> {
        Ok(LittleEndian::read_u32(self.take_bytes(4)?))
    }

    pub fn take_u64(&mut self) -> Result<u64, FormatError> {
        Ok(LittleEndian::read_u64(self.take_bytes(8)?))
    }
}
