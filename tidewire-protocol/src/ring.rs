//! Fixed-capacity circular byte buffer.
//!
//! A [`RingBuffer`] absorbs partial socket reads for one connection and lets the
//! frame parser look at buffered bytes without copying them out. Capacity is
//! always a power of two so positions wrap with a mask.
//!
//! Two families of accessors are provided with identical semantics:
//! - copying: [`write`](RingBuffer::write), [`read`](RingBuffer::read),
//!   [`peek`](RingBuffer::peek) move bytes through caller-owned slices;
//! - zero-copy: [`writable_slices`](RingBuffer::writable_slices) +
//!   [`commit`](RingBuffer::commit), [`peek_slices`](RingBuffer::peek_slices)
//!   and [`read_with`](RingBuffer::read_with) borrow the ring's own storage as
//!   (at most) two contiguous regions.
//!
//! The buffer is not internally synchronized; it is owned by exactly one receive
//! path.

use crate::error::ProtocolError;
use crate::frame::{FrameFlags, FrameHeader, HEADER_SIZE};

/// Largest capacity accepted (1 GiB).
pub const MAX_RING_CAPACITY: usize = 1 << 30;

/// Circular byte buffer with power-of-two capacity.
pub struct RingBuffer {
    buf: Box<[u8]>,
    mask: usize,
    head: usize,
    len: usize,
}

impl RingBuffer {
    /// Creates a ring buffer with `capacity` rounded up to the next power of two.
    pub fn with_capacity(capacity: usize) -> Result<Self, ProtocolError> {
        if capacity == 0 || capacity > MAX_RING_CAPACITY {
            return Err(ProtocolError::InvalidCapacity(capacity));
        }
        let capacity = capacity
            .checked_next_power_of_two()
            .ok_or(ProtocolError::InvalidCapacity(capacity))?;

        Ok(Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            mask: capacity - 1,
            head: 0,
            len: 0,
        })
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bytes that can be written before the buffer is full.
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    #[inline]
    fn pos(&self, offset: usize) -> usize {
        (self.head + offset) & self.mask
    }

    /// Copies as much of `src` as fits. Returns the number of bytes written;
    /// the caller must re-offer the remainder later.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let (first, second) = self.writable_slices();
        let n = src.len().min(first.len() + second.len());
        let split = n.min(first.len());
        first[..split].copy_from_slice(&src[..split]);
        second[..n - split].copy_from_slice(&src[split..n]);
        self.commit(n);
        n
    }

    /// Returns the free region as two mutable slices (the second is empty unless
    /// the free space wraps). Fill them and then call [`commit`](Self::commit).
    pub fn writable_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        let capacity = self.capacity();
        let free = self.free();
        let tail = self.pos(self.len);
        let first_len = free.min(capacity - tail);
        let second_len = free - first_len;

        let (lo, hi) = self.buf.split_at_mut(tail);
        (&mut hi[..first_len], &mut lo[..second_len])
    }

    /// Marks `n` bytes of the writable region as filled. Clamped to free space.
    pub fn commit(&mut self, n: usize) -> usize {
        let n = n.min(self.free());
        self.len += n;
        n
    }

    /// Borrows `len` bytes starting `skip` bytes in, as two slices.
    /// Returns `None` if fewer than `skip + len` bytes are buffered.
    pub fn peek_slices(&self, skip: usize, len: usize) -> Option<(&[u8], &[u8])> {
        if skip.checked_add(len)? > self.len {
            return None;
        }
        let start = self.pos(skip);
        let first_len = len.min(self.capacity() - start);
        Some((
            &self.buf[start..start + first_len],
            &self.buf[..len - first_len],
        ))
    }

    /// Copies `dst.len()` bytes starting `skip` bytes in, without consuming.
    /// Returns 0 (and copies nothing) if not enough bytes are buffered.
    pub fn peek(&self, dst: &mut [u8], skip: usize) -> usize {
        match self.peek_slices(skip, dst.len()) {
            Some((a, b)) => {
                dst[..a.len()].copy_from_slice(a);
                dst[a.len()..].copy_from_slice(b);
                dst.len()
            }
            None => 0,
        }
    }

    /// Like [`peek`](Self::peek), then consumes `skip + dst.len()` bytes.
    /// With an empty `dst` this only discards `skip` bytes, if buffered.
    pub fn read(&mut self, dst: &mut [u8], skip: usize) -> usize {
        let len = dst.len();
        self.read_with(skip, len, |a, b| {
            dst[..a.len()].copy_from_slice(a);
            dst[a.len()..].copy_from_slice(b);
        })
        .map_or(0, |()| len)
    }

    /// Hands `len` bytes starting at `skip` to `f` as two borrowed slices, then
    /// consumes `skip + len` bytes. Returns `None` without mutation if not
    /// enough bytes are buffered.
    pub fn read_with<R>(
        &mut self,
        skip: usize,
        len: usize,
        f: impl FnOnce(&[u8], &[u8]) -> R,
    ) -> Option<R> {
        let (a, b) = self.peek_slices(skip, len)?;
        let out = f(a, b);
        self.consume(skip + len);
        Some(out)
    }

    /// Returns the byte `offset` positions past the read pointer.
    pub fn peek_byte(&self, offset: usize) -> Option<u8> {
        if offset < self.len {
            Some(self.buf[self.pos(offset)])
        } else {
            None
        }
    }

    /// Parses the fixed frame header located `skip` bytes in, reading straight
    /// out of the ring. Returns `None` when fewer than [`HEADER_SIZE`] bytes
    /// are available. The header is not validated here.
    pub fn peek_header(&self, skip: usize) -> Option<FrameHeader> {
        if skip.checked_add(HEADER_SIZE)? > self.len {
            return None;
        }
        let at = |i: usize| self.buf[self.pos(skip + i)];
        Some(FrameHeader {
            flags: FrameFlags::from_raw(at(0)),
            id: u16::from_be_bytes([at(1), at(2)]),
            data_len: u16::from_be_bytes([at(3), at(4)]),
            checksum: u16::from_be_bytes([at(5), at(6)]),
        })
    }

    /// Advances the read pointer by up to `n` bytes. Returns the amount consumed.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.len -= n;
        self.head = if self.len == 0 { 0 } else { self.pos(n) };
        n
    }

    /// Moves the read pointer just past the first `sentinel` at or after `skip`.
    /// Returns `false` (without mutation) if no sentinel is buffered there.
    pub fn skip_until(&mut self, skip: usize, sentinel: u8) -> bool {
        if skip >= self.len {
            return false;
        }
        let Some((a, b)) = self.peek_slices(skip, self.len - skip) else {
            return false;
        };
        let found = a
            .iter()
            .position(|&x| x == sentinel)
            .or_else(|| b.iter().position(|&x| x == sentinel).map(|i| a.len() + i));

        match found {
            Some(idx) => {
                self.consume(skip + idx + 1);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("head", &self.head)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn test_capacity_rounding() {
        assert_eq!(RingBuffer::with_capacity(1).unwrap().capacity(), 1);
        assert_eq!(RingBuffer::with_capacity(5).unwrap().capacity(), 8);
        assert_eq!(RingBuffer::with_capacity(64).unwrap().capacity(), 64);
        assert_eq!(RingBuffer::with_capacity(1000).unwrap().capacity(), 1024);
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            RingBuffer::with_capacity(0),
            Err(ProtocolError::InvalidCapacity(0))
        ));
        assert!(RingBuffer::with_capacity(usize::MAX).is_err());
        assert!(RingBuffer::with_capacity(MAX_RING_CAPACITY + 1).is_err());
    }

    #[test]
    fn test_short_write_on_overflow() {
        let mut ring = RingBuffer::with_capacity(8).unwrap();
        assert_eq!(ring.write(b"abcde"), 5);
        assert_eq!(ring.write(b"fghij"), 3);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.write(b"x"), 0);

        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out, 0), 8);
        assert_eq!(&out, b"abcdefgh");
    }

    #[test]
    fn test_read_insufficient_is_noop() {
        let mut ring = RingBuffer::with_capacity(16).unwrap();
        ring.write(b"abc");

        let mut out = [0u8; 2];
        assert_eq!(ring.read(&mut out, 2), 0);
        assert_eq!(ring.len(), 3);

        assert_eq!(ring.read(&mut out, 1), 2);
        assert_eq!(&out, b"bc");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_empty_read_discards_skip() {
        let mut ring = RingBuffer::with_capacity(16).unwrap();
        ring.write(b"abcde");

        assert_eq!(ring.read(&mut [], 6), 0);
        assert_eq!(ring.len(), 5);

        assert_eq!(ring.read(&mut [], 2), 0);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.peek_byte(0), Some(b'c'));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut ring = RingBuffer::with_capacity(16).unwrap();
        ring.write(b"hello");

        let mut out = [0u8; 3];
        assert_eq!(ring.peek(&mut out, 1), 3);
        assert_eq!(&out, b"ell");
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.peek_byte(4), Some(b'o'));
        assert_eq!(ring.peek_byte(5), None);
    }

    #[test]
    fn test_wraparound_slices() {
        let mut ring = RingBuffer::with_capacity(8).unwrap();
        ring.write(b"123456");
        ring.consume(5);
        ring.write(b"abcdef");

        let (a, b) = ring.peek_slices(0, 7).unwrap();
        assert_eq!(a, b"6ab");
        assert_eq!(b, b"cdef");

        let joined = ring.read_with(1, 6, |a, b| [a, b].concat()).unwrap();
        assert_eq!(joined, b"abcdef");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_zero_copy_write() {
        let mut ring = RingBuffer::with_capacity(8).unwrap();
        ring.write(b"xxxxxx");
        ring.consume(5);

        let (first, second) = ring.writable_slices();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 5);
        first.copy_from_slice(b"ab");
        second.copy_from_slice(b"cdefg");
        assert_eq!(ring.commit(100), 7);

        let mut out = [0u8; 8];
        ring.peek(&mut out, 0);
        assert_eq!(&out, b"xabcdefg");
    }

    #[test]
    fn test_skip_until() {
        let mut ring = RingBuffer::with_capacity(16).unwrap();
        ring.write(&[0, 1, 2, 0, 3, 4]);

        assert!(ring.skip_until(1, 0));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.peek_byte(0), Some(3));

        assert!(!ring.skip_until(0, 0));
        assert_eq!(ring.len(), 2);
        assert!(!ring.skip_until(5, 0));
    }

    #[test]
    fn test_skip_until_across_wrap() {
        let mut ring = RingBuffer::with_capacity(8).unwrap();
        ring.write(&[9; 6]);
        ring.consume(5);
        ring.write(&[1, 2, 3, 0, 5]);

        assert!(ring.skip_until(1, 0));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.peek_byte(0), Some(5));
    }

    #[test]
    fn test_peek_header_across_wrap() {
        let mut ring = RingBuffer::with_capacity(8).unwrap();
        ring.write(&[0; 5]);
        ring.consume(4);
        ring.write(&[0x02, 0x00, 0x07, 0x00, 0x09, 0xab, 0xcd]);

        let header = ring.peek_header(1).unwrap();
        assert!(header.flags.is_request());
        assert_eq!(header.id, 7);
        assert_eq!(header.data_len, 9);
        assert_eq!(header.checksum, 0xabcd);

        assert!(ring.peek_header(2).is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(Vec<u8>),
        Read(usize),
        Skip(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..40).prop_map(Op::Write),
            (0usize..40).prop_map(Op::Read),
            (0usize..8).prop_map(Op::Skip),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_reference_queue(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let mut ring = RingBuffer::with_capacity(32).unwrap();
            let mut model: VecDeque<u8> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Write(data) => {
                        let written = ring.write(&data);
                        let expected = data.len().min(32 - model.len());
                        prop_assert_eq!(written, expected);
                        model.extend(&data[..written]);
                    }
                    Op::Read(n) => {
                        let mut out = vec![0u8; n];
                        let got = ring.read(&mut out, 0);
                        if n <= model.len() {
                            prop_assert_eq!(got, n);
                            let expected: Vec<u8> = model.drain(..n).collect();
                            prop_assert_eq!(out, expected);
                        } else {
                            prop_assert_eq!(got, 0);
                        }
                    }
                    Op::Skip(n) => {
                        let consumed = ring.consume(n);
                        prop_assert_eq!(consumed, n.min(model.len()));
                        model.drain(..consumed);
                    }
                }
                prop_assert_eq!(ring.len(), model.len());
            }

            let mut rest = vec![0u8; model.len()];
            ring.peek(&mut rest, 0);
            prop_assert_eq!(rest, model.iter().copied().collect::<Vec<_>>());
        }

        #[test]
        fn prop_chunked_transfer_matches_contiguous(
            data in proptest::collection::vec(any::<u8>(), 0..500),
            step in 1usize..17,
        ) {
            let mut ring = RingBuffer::with_capacity(16).unwrap();
            let mut out = Vec::new();
            let mut pos = 0;

            while pos < data.len() || !ring.is_empty() {
                let end = (pos + step).min(data.len());
                pos += ring.write(&data[pos..end]);
                let take = ring.len().min(step);
                if let Some(chunk) = ring.read_with(0, take, |a, b| [a, b].concat()) {
                    out.extend(chunk);
                }
            }
            prop_assert_eq!(out, data);
        }
    }
}
