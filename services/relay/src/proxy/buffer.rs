//! Bounded byte buffer used for each relay direction.
//!
//! A linear buffer with separate read and write cursors. Producers fill the
//! tail through [`Buffer::write_window`], consumers drain the head through
//! [`Buffer::read_window`]. No I/O happens here; callers issue the
//! non-blocking syscalls against the exposed windows and report how many
//! bytes actually moved.
//!
//! Invariant: `0 <= read_offset <= write_offset <= capacity`.
//!
//! The buffer compacts itself so that it never looks full while holding
//! already-drained bytes: a full drain resets both cursors to zero, and
//! requesting the write window moves any pending bytes to the head first.

use thiserror::Error;

/// Errors from advancing a cursor past the data it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer overflow: advance by {requested} with {available} bytes free")]
    Overflow { requested: usize, available: usize },

    #[error("buffer underflow: advance by {requested} with {available} bytes pending")]
    Underflow { requested: usize, available: usize },
}

/// Fixed-capacity byte buffer with separate read and write cursors.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    read_offset: usize,
    write_offset: usize,
}

impl Buffer {
    /// Allocate a buffer of `capacity` bytes. The buffer is never resized.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_offset: 0,
            write_offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes available to drain.
    pub fn pending(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// Bytes that may still be written.
    pub fn free_space(&self) -> usize {
        self.capacity() - self.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    /// Region a receive may fill; its length is always `free_space()`.
    pub fn write_window(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.data[self.write_offset..]
    }

    /// Commit `n` bytes written into the write window.
    pub fn advance_write(&mut self, n: usize) -> Result<(), BufferError> {
        let available = self.free_space();
        if n > available {
            return Err(BufferError::Overflow {
                requested: n,
                available,
            });
        }
        if self.write_offset + n > self.capacity() {
            self.compact();
        }
        self.write_offset += n;
        Ok(())
    }

    /// Pending bytes, in order; its length is always `pending()`.
    pub fn read_window(&self) -> &[u8] {
        &self.data[self.read_offset..self.write_offset]
    }

    /// Consume `n` bytes from the read window.
    pub fn advance_read(&mut self, n: usize) -> Result<(), BufferError> {
        let available = self.pending();
        if n > available {
            return Err(BufferError::Underflow {
                requested: n,
                available,
            });
        }
        self.read_offset += n;
        if self.read_offset == self.write_offset {
            self.reset();
        }
        Ok(())
    }

    /// Drop all pending bytes.
    pub fn reset(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;
    }

    /// Move pending bytes to the head of the storage.
    fn compact(&mut self) {
        if self.read_offset == 0 {
            return;
        }
        self.data.copy_within(self.read_offset..self.write_offset, 0);
        self.write_offset -= self.read_offset;
        self.read_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buf: &mut Buffer, bytes: &[u8]) {
        buf.write_window()[..bytes.len()].copy_from_slice(bytes);
        buf.advance_write(bytes.len()).unwrap();
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = Buffer::new(1024);
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(buf.pending(), 0);
        assert_eq!(buf.free_space(), 1024);
        assert!(buf.is_empty());
        assert!(!buf.is_full());
    }

    #[test]
    fn test_write_then_read() {
        let mut buf = Buffer::new(16);
        fill(&mut buf, b"ping");

        assert_eq!(buf.pending(), 4);
        assert_eq!(buf.free_space(), 12);
        assert_eq!(buf.read_window(), b"ping");

        buf.advance_read(2).unwrap();
        assert_eq!(buf.read_window(), b"ng");
        assert_eq!(buf.read_offset(), 2);
    }

    #[test]
    fn test_full_drain_resets_offsets() {
        let mut buf = Buffer::new(8);
        fill(&mut buf, b"12345678");
        assert!(buf.is_full());

        buf.advance_read(8).unwrap();
        assert_eq!(buf.read_offset(), 0);
        assert_eq!(buf.write_offset(), 0);
        assert_eq!(buf.free_space(), 8);
    }

    #[test]
    fn test_partial_drain_compacts_on_write() {
        let mut buf = Buffer::new(8);
        fill(&mut buf, b"abcdefgh");
        buf.advance_read(6).unwrap();

        // Two bytes pending, six free: the window must expose all six.
        assert_eq!(buf.free_space(), 6);
        assert_eq!(buf.write_window().len(), 6);
        assert_eq!(buf.read_window(), b"gh");

        fill(&mut buf, b"ijk");
        assert_eq!(buf.read_window(), b"ghijk");
    }

    #[test]
    fn test_overflow_leaves_state_untouched() {
        let mut buf = Buffer::new(4);
        fill(&mut buf, b"abc");

        let err = buf.advance_write(2).unwrap_err();
        assert_eq!(
            err,
            BufferError::Overflow {
                requested: 2,
                available: 1
            }
        );
        assert_eq!(buf.pending(), 3);
        assert_eq!(buf.write_offset(), 3);
    }

    #[test]
    fn test_underflow_leaves_state_untouched() {
        let mut buf = Buffer::new(4);
        fill(&mut buf, b"ab");
        buf.advance_read(1).unwrap();

        let err = buf.advance_read(2).unwrap_err();
        assert_eq!(
            err,
            BufferError::Underflow {
                requested: 2,
                available: 1
            }
        );
        assert_eq!(buf.read_offset(), 1);
        assert_eq!(buf.write_offset(), 2);
    }

    #[test]
    fn test_advance_write_without_window_compacts() {
        let mut buf = Buffer::new(4);
        fill(&mut buf, b"abcd");
        buf.advance_read(3).unwrap();

        buf.advance_write(3).unwrap();
        assert_eq!(buf.pending(), 4);
        assert_eq!(buf.read_offset(), 0);
        assert_eq!(buf.read_window()[0], b'd');
    }

    #[test]
    fn test_reset() {
        let mut buf = Buffer::new(4);
        fill(&mut buf, b"ab");
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.free_space(), 4);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Write(usize),
            Read(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![(0usize..48).prop_map(Op::Write), (0usize..48).prop_map(Op::Read)]
        }

        proptest! {
            #[test]
            fn cursors_stay_ordered(ops in proptest::collection::vec(op(), 0..200)) {
                let mut buf = Buffer::new(32);
                let mut model: std::collections::VecDeque<u8> = Default::default();
                let mut next = 0u8;

                for op in ops {
                    let before = (buf.read_offset(), buf.write_offset());
                    match op {
                        Op::Write(n) => {
                            let fits = n <= buf.free_space();
                            if fits {
                                let window = buf.write_window();
                                for byte in window.iter_mut().take(n) {
                                    *byte = next;
                                    model.push_back(next);
                                    next = next.wrapping_add(1);
                                }
                            }
                            let result = buf.advance_write(n);
                            prop_assert_eq!(result.is_ok(), fits);
                            if !fits {
                                prop_assert_eq!((buf.read_offset(), buf.write_offset()), before);
                            }
                        }
                        Op::Read(n) => {
                            let fits = n <= buf.pending();
                            let result = buf.advance_read(n);
                            prop_assert_eq!(result.is_ok(), fits);
                            if fits {
                                model.drain(..n);
                            } else {
                                prop_assert_eq!((buf.read_offset(), buf.write_offset()), before);
                            }
                        }
                    }

                    prop_assert!(buf.read_offset() <= buf.write_offset());
                    prop_assert!(buf.write_offset() <= buf.capacity());
                    prop_assert_eq!(buf.pending(), model.len());
                    prop_assert!(buf.read_window().iter().eq(model.iter()));
                }
            }
        }
    }
}
