//! Refillable byte window shared by all wire primitives.
//!
//! Decoding never sees the transport. A [`Buffer`] is a contiguous
//! window with a read cursor and a write cursor; when a primitive runs
//! out of bytes mid-parse it rewinds its own partial consumption, asks
//! the attached [`Refill`] source for more, and retries. A buffer with
//! no source simply runs dry, which is the normal mode for tests and
//! for callers that frame messages themselves.

use crate::{Error, Result};

/// Upper bound on a single encoded message, and the refill chunk size.
pub const MESSAGE_MAX_SIZE: usize = 2048;

/// Source of additional bytes for a [`Buffer`] that runs dry.
///
/// Implemented for every [`std::io::Read`], so a `File`, a
/// `TcpStream`, or an [`std::io::Cursor`] can back a buffer directly.
pub trait Refill {
    /// Read more bytes into `dst`, returning how many were read.
    ///
    /// `Ok(0)` means end of stream; a primitive that still needs bytes
    /// at that point reports the stream as garbled.
    fn refill(&mut self, dst: &mut [u8]) -> Result<usize>;
}

impl<R: std::io::Read> Refill for R {
    fn refill(&mut self, dst: &mut [u8]) -> Result<usize> {
        Ok(self.read(dst)?)
    }
}

/// Contiguous byte window with read and write cursors.
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
    source: Option<Box<dyn Refill>>,
}

impl Buffer {
    /// Create an empty buffer with the given capacity and no source.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            start: 0,
            end: 0,
            source: None,
        }
    }

    /// Create a buffer holding a copy of `data`, ready for reading.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            start: 0,
            end: data.len(),
            source: None,
        }
    }

    /// Attach a refill source.
    ///
    /// The buffer should have room for at least two maximum-size
    /// messages, so that compaction always leaves a full refill chunk
    /// of free space.
    #[must_use]
    pub fn with_source(mut self, source: Box<dyn Refill>) -> Self {
        self.source = Some(source);
        self
    }

    /// Number of unread bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True if there is nothing left to read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Write-side space left before the capacity is hit.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.end
    }

    /// The unread bytes.
    #[must_use]
    pub fn slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Peek at the next unread byte without consuming it.
    #[must_use]
    pub fn first(&self) -> Option<u8> {
        if self.start < self.end {
            Some(self.data[self.start])
        } else {
            None
        }
    }

    /// Consume and return the next unread byte.
    pub fn take(&mut self) -> Option<u8> {
        let c = self.first()?;
        self.start += 1;
        Some(c)
    }

    /// Skip `n` unread bytes.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len());
        self.start += n;
    }

    /// Walk the read cursor back over `n` already-consumed bytes.
    pub fn rewind(&mut self, n: usize) {
        assert!(n <= self.start);
        self.start -= n;
    }

    /// Append one byte at the write cursor.
    pub fn put(&mut self, byte: u8) -> Result<()> {
        if self.end == self.data.len() {
            return Err(Error::Overflow);
        }
        self.data[self.end] = byte;
        self.end += 1;
        Ok(())
    }

    /// Append a run of bytes at the write cursor.
    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<()> {
        if self.remaining() < bytes.len() {
            return Err(Error::Overflow);
        }
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(())
    }

    /// Discard everything and reset both cursors.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Move the unread bytes to the front of the window.
    pub fn compact(&mut self) {
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// Pull more bytes from the attached source.
    ///
    /// Compacts first when write-side space has fallen below one
    /// maximum message. Returns the number of new bytes, with zero
    /// meaning the source is exhausted (or absent).
    pub fn fill(&mut self) -> Result<usize> {
        if self.source.is_none() {
            return Ok(0);
        }
        if self.remaining() <= MESSAGE_MAX_SIZE {
            self.compact();
        }
        let end = self.end;
        match &mut self.source {
            None => Ok(0),
            Some(source) => {
                let n = source.refill(&mut self.data[end..])?;
                self.end += n;
                Ok(n)
            }
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors() {
        let mut b = Buffer::from_slice(&[1, 2, 3]);
        assert_eq!(b.len(), 3);
        assert_eq!(b.first(), Some(1));
        assert_eq!(b.take(), Some(1));
        assert_eq!(b.take(), Some(2));
        b.rewind(2);
        assert_eq!(b.take(), Some(1));
        b.advance(2);
        assert_eq!(b.take(), None);
    }

    #[test]
    fn put_respects_capacity() {
        let mut b = Buffer::new(2);
        b.put(10).unwrap();
        b.put(20).unwrap();
        assert!(matches!(b.put(30), Err(Error::Overflow)));
        assert_eq!(b.slice(), &[10, 20]);
    }

    #[test]
    fn fill_from_reader() -> Result<()> {
        let src = std::io::Cursor::new(vec![7u8; 10]);
        let mut b = Buffer::new(2 * MESSAGE_MAX_SIZE + 16).with_source(Box::new(src));
        assert!(b.is_empty());
        assert_eq!(b.fill()?, 10);
        assert_eq!(b.len(), 10);
        assert_eq!(b.fill()?, 0);
        Ok(())
    }

    #[test]
    fn fill_compacts_when_tight() -> Result<()> {
        let src = std::io::Cursor::new(vec![9u8; 4]);
        let mut b = Buffer::new(MESSAGE_MAX_SIZE).with_source(Box::new(src));
        for i in 0..8 {
            b.put(i)?;
        }
        b.advance(8);
        assert_eq!(b.fill()?, 4);
        // Compaction moved the (fully consumed) window to the front.
        assert_eq!(b.slice(), &[9, 9, 9, 9]);
        Ok(())
    }

    #[test]
    fn fill_from_file() -> Result<()> {
        let tmpd = tempfile::tempdir()?;
        let path = tmpd.path().join("feed.bin");
        std::fs::write(&path, [0x81, 0x82, 0x83])?;
        let f = std::fs::File::open(&path)?;
        let mut b = Buffer::new(2 * MESSAGE_MAX_SIZE).with_source(Box::new(f));
        assert_eq!(b.fill()?, 3);
        assert_eq!(b.slice(), &[0x81, 0x82, 0x83]);
        Ok(())
    }
}
