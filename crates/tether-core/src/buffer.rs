//! Per-peer receive accumulator.
//!
//! Socket reads land at the tail; whole frames are consumed from the front
//! with a memmove so the invariant holds: after a reception cycle the
//! accumulator contains at most one incomplete tail frame.

use std::fmt;

use tether_proto::RECV_BUFFER_SIZE;

/// Fixed-capacity byte accumulator between a socket and the frame decoder.
pub struct RecvBuffer {
    buf: Box<[u8]>,
    len: usize,
}

impl RecvBuffer {
    /// Create an empty accumulator with the protocol's fixed capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            len: 0,
        }
    }

    /// Bytes accumulated so far.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Unused tail capacity for the next socket read.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Record `n` bytes written into [`RecvBuffer::space`].
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.buf.len());
        self.len = (self.len + n).min(self.buf.len());
    }

    /// Drop `n` consumed bytes from the front, sliding the tail down.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        let n = n.min(self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Accumulated byte count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecvBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvBuffer")
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_consume_keep_the_tail() {
        let mut buf = RecvBuffer::new();
        buf.space()[..5].copy_from_slice(b"abcde");
        buf.advance(5);
        assert_eq!(buf.data(), b"abcde");

        buf.consume(2);
        assert_eq!(buf.data(), b"cde");

        buf.space()[..2].copy_from_slice(b"fg");
        buf.advance(2);
        assert_eq!(buf.data(), b"cdefg");
    }

    #[test]
    fn clear_resets() {
        let mut buf = RecvBuffer::new();
        buf.space()[..3].copy_from_slice(b"xyz");
        buf.advance(3);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.space().len(), RECV_BUFFER_SIZE);
    }
}
