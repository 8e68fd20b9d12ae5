//! Growable byte buffer used by secure sessions.
//!
//! A `SessionBuffer` tracks a read position and a write position over a
//! zero-filled allocation, so that spare capacity can be handed directly to
//! a socket read or to the engine as a destination slice. Unlike a
//! `BytesMut`, the logical capacity is explicit: it only changes through
//! `grow_to()`, which is what the session's grow-or-reset policy is built on.

/// A byte buffer with explicit capacity and read/write cursors.
///
/// # Example
///
/// ```
/// use shroud::buffer::SessionBuffer;
///
/// let mut buf = SessionBuffer::new(16);
/// buf.spare_mut()[..5].copy_from_slice(b"hello");
/// buf.commit(5);
/// assert_eq!(buf.as_slice(), b"hello");
///
/// buf.consume(2);
/// assert_eq!(buf.as_slice(), b"llo");
/// ```
#[derive(Debug)]
pub struct SessionBuffer {
    data: Vec<u8>,
    /// Bytes before this have been consumed
    read_pos: usize,
    /// Bytes have been written up to here
    write_pos: usize,
}

impl SessionBuffer {
    /// Create a buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Number of bytes that can still be written without compacting.
    #[inline]
    pub fn spare_capacity(&self) -> usize {
        self.data.len() - self.write_pos
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Record that `n` bytes were written into `spare_mut()`.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the spare capacity.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        assert!(
            n <= self.spare_capacity(),
            "commit({}) exceeds spare capacity ({})",
            n,
            self.spare_capacity()
        );
        self.write_pos += n;
    }

    /// Drop `n` bytes from the front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the readable bytes.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.len(),
            "consume({}) exceeds readable bytes ({})",
            n,
            self.len()
        );
        self.read_pos += n;

        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Move unread bytes to the start of the allocation.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }

        let readable = self.len();
        if readable > 0 {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
        }
        self.read_pos = 0;
        self.write_pos = readable;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Grow the capacity to at least `capacity`, keeping unread bytes.
    ///
    /// Returns `false` if the buffer was already large enough.
    pub fn grow_to(&mut self, capacity: usize) -> bool {
        if capacity <= self.data.len() {
            return false;
        }
        self.compact();
        self.data.resize(capacity, 0);
        true
    }

    /// Append `data` after the readable bytes, growing first if it does not fit.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if self.spare_capacity() < data.len() {
            self.compact();
            self.grow_to(self.len() + data.len());
        }
        self.spare_mut()[..data.len()].copy_from_slice(data);
        self.commit(data.len());
    }
}
