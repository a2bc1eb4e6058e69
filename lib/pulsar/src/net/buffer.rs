use std::io;

/// Governs which end of the buffer is active. In `Append` mode new bytes are
/// written at `position` and the unread region starts at `start`. In `Read`
/// mode `position` is the read cursor and `limit` marks the end of the data.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BufferMode {
    Append,
    Read,
}

/// A fixed-capacity byte region with an explicit append/read mode and a
/// persistent unread-start cursor.
///
/// The unread cursor survives mode flips: appending after a partial read
/// continues to fill the tail of the buffer without losing the unread prefix,
/// which is what lets a connection interleave socket reads with incremental
/// parsing of the same region.
pub struct NetBuffer {
    data: Vec<u8>,
    mode: BufferMode,
    position: usize,
    limit: usize,
    start: usize,
    tag: u64,
}

impl NetBuffer {
    /// Creates a buffer with the given fixed capacity, in cleared append
    /// mode.
    pub fn new(capacity: usize) -> NetBuffer {
        NetBuffer {
            data: vec![0; capacity],
            mode: BufferMode::Append,
            position: 0,
            limit: capacity,
            start: 0,
            tag: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Pool identity of this buffer. Zero for buffers that never went through
    /// a pool. The tag is stable across reuse so pooled buffers can be told
    /// apart independently of their contents.
    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    #[inline]
    pub(crate) fn set_tag(&mut self, tag: u64) {
        self.tag = tag;
    }

    /// Switches to append mode, keeping the current data. New writes land at
    /// the tail; the unread cursor is pinned to the current read position.
    /// No-op when already appending.
    pub fn flip_append(&mut self) {
        if self.mode == BufferMode::Append {
            return;
        }

        self.start = self.position;
        self.position = self.limit;
        self.limit = self.capacity();
        self.mode = BufferMode::Append;
    }

    /// Switches to read mode over the unread region. No-op when already
    /// reading.
    pub fn flip_read(&mut self) {
        if self.mode == BufferMode::Read {
            return;
        }

        self.limit = self.position;
        self.position = self.start;
        self.mode = BufferMode::Read;
    }

    /// Drops all content and resets to a cleared append-mode buffer.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
        self.start = 0;
        self.mode = BufferMode::Append;
    }

    /// Moves the unread bytes to offset zero and opens the rest of the buffer
    /// for appending.
    pub fn compact(&mut self) {
        let (from, to) = self.unread_range();
        let count = to - from;

        self.data.copy_within(from..to, 0);
        self.start = 0;
        self.position = count;
        self.limit = self.capacity();
        self.mode = BufferMode::Append;
    }

    /// Number of unread bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        let (from, to) = self.unread_range();
        to - from
    }

    /// Room left for appending under the current mode.
    #[inline]
    pub fn free(&self) -> usize {
        match self.mode {
            BufferMode::Append => self.limit - self.position,
            BufferMode::Read => self.capacity() - self.limit,
        }
    }

    /// True when there are no bytes available for reading.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// True when there is no room for appending under the current mode.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// True when the buffer is in its pristine post-`clear` state.
    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.mode == BufferMode::Append
            && self.position == 0
            && self.limit == self.capacity()
            && self.start == 0
    }

    /// True when the unread region starts at offset zero.
    #[inline]
    pub fn is_compacted(&self) -> bool {
        self.start == 0
    }

    /// True when the capacity is below `required`.
    #[inline]
    pub fn needs_resize(&self, required: usize) -> bool {
        self.capacity() < required
    }

    /// Reallocates to `capacity` bytes, compacting the unread bytes to offset
    /// zero. No-op when the capacity already matches.
    pub fn resize(&mut self, capacity: usize) {
        if self.capacity() == capacity {
            return;
        }

        let (from, to) = self.unread_range();
        let count = to - from;
        debug_assert!(count <= capacity, "resize would drop unread data");

        let mut data = vec![0; capacity];
        data[..count].copy_from_slice(&self.data[from..to]);

        self.data = data;
        self.start = 0;
        self.position = count;
        self.limit = capacity;
        self.mode = BufferMode::Append;
    }

    /// Reallocates to `capacity` bytes, discarding all content.
    pub fn resize_unsafe(&mut self, capacity: usize) {
        self.data = vec![0; capacity];
        self.clear();
    }

    /// The unread bytes, in either mode.
    #[inline]
    pub fn unread_slice(&self) -> &[u8] {
        let (from, to) = self.unread_range();
        &self.data[from..to]
    }

    /// The readable region. Only valid in read mode.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        debug_assert_eq!(self.mode, BufferMode::Read);
        &self.data[self.position..self.limit]
    }

    /// The writable region. Only valid in append mode.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.mode, BufferMode::Append);
        let limit = self.limit;
        let position = self.position;
        &mut self.data[position..limit]
    }

    /// Advances the read cursor. Only valid in read mode.
    #[inline]
    pub fn advance_read(&mut self, count: usize) {
        debug_assert_eq!(self.mode, BufferMode::Read);
        debug_assert!(self.position + count <= self.limit);
        self.position += count;
    }

    /// Advances the write cursor. Only valid in append mode.
    #[inline]
    pub fn advance_write(&mut self, count: usize) {
        debug_assert_eq!(self.mode, BufferMode::Append);
        debug_assert!(self.position + count <= self.limit);
        self.position += count;
    }

    /// Copies as much of `src` as fits into the append region and returns the
    /// number of bytes taken. Flips to append mode if necessary.
    pub fn put(&mut self, src: &[u8]) -> usize {
        self.flip_append();

        let count = src.len().min(self.free());
        self.write_slice()[..count].copy_from_slice(&src[..count]);
        self.advance_write(count);
        count
    }

    /// Performs a single read from `reader` into the append region.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let count = reader.read(self.write_slice())?;
        self.advance_write(count);
        Ok(count)
    }

    /// Performs a single write of the readable region into `writer`.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let count = writer.write(self.read_slice())?;
        self.advance_read(count);
        Ok(count)
    }

    /// Absolute read cursor. Only meaningful in read mode.
    #[inline]
    pub(crate) fn read_pos(&self) -> usize {
        self.position
    }

    /// The whole backing region, for absolute-offset slicing by the parser.
    #[inline]
    pub(crate) fn storage(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn unread_range(&self) -> (usize, usize) {
        match self.mode {
            BufferMode::Append => (self.start, self.position),
            BufferMode::Read => (self.position, self.limit),
        }
    }
}
