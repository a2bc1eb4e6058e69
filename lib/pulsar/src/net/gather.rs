use crate::net::buffer::NetBuffer;
use std::cell::RefCell;
use std::rc::Rc;

/// A bounded free-list of reusable fixed-size buffers.
///
/// Each buffer that passes through the pool carries a monotonically assigned
/// tag, so pooled buffers have a stable identity independent of their
/// contents. Released entries beyond the pool bound are simply dropped.
/// Entries are reset on allocation, never on release.
pub struct BufferPool {
    entry_size: usize,
    capacity: usize,
    free: Vec<NetBuffer>,
    next_tag: u64,
}

/// Shared handle to a pool. The pool is single-threaded state owned by the
/// reactor side; the handle is only ever cloned within that thread.
pub type PoolHandle = Rc<RefCell<BufferPool>>;

impl BufferPool {
    pub fn new(entry_size: usize, capacity: usize) -> BufferPool {
        BufferPool {
            entry_size,
            capacity,
            free: Vec::new(),
            next_tag: 1,
        }
    }

    /// Wraps a new pool in a shared handle.
    pub fn handle(entry_size: usize, capacity: usize) -> PoolHandle {
        Rc::new(RefCell::new(BufferPool::new(entry_size, capacity)))
    }

    #[inline]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Returns a cleared buffer, reusing a free entry when one is available.
    pub fn allocate(&mut self) -> NetBuffer {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => {
                let mut buf = NetBuffer::new(self.entry_size);
                buf.set_tag(self.next_tag);
                self.next_tag += 1;
                buf
            }
        }
    }

    /// Returns a buffer to the free list, discarding it when the pool is at
    /// capacity or the buffer was resized away from the pool entry size.
    pub fn release(&mut self, buf: NetBuffer) {
        if self.free.len() < self.capacity && buf.capacity() == self.entry_size {
            self.free.push(buf);
        }
    }

    pub fn release_all<I: IntoIterator<Item = NetBuffer>>(&mut self, bufs: I) {
        for buf in bufs {
            self.release(buf);
        }
    }
}

/// Builds an ordered sequence of pooled buffers for a gathered write.
///
/// Body bytes fill fixed-size segments sequentially. A prepend and an append
/// section can be filled through scoped [`Inserter`]s; their bytes are
/// stitched before and after the body when the final buffer array is built.
pub struct GatherBuilder {
    pool: PoolHandle,
    front: Vec<NetBuffer>,
    body: Vec<NetBuffer>,
    back: Vec<NetBuffer>,
}

impl GatherBuilder {
    pub fn new(pool: PoolHandle) -> GatherBuilder {
        GatherBuilder {
            pool,
            front: Vec::new(),
            body: Vec::new(),
            back: Vec::new(),
        }
    }

    /// Appends raw bytes to the body, growing the segment list as needed.
    pub fn write_bytes(&mut self, src: &[u8]) {
        let pool = Rc::clone(&self.pool);
        write_segmented(&mut self.body, &pool, src);
    }

    #[inline]
    pub fn write_str(&mut self, src: &str) {
        self.write_bytes(src.as_bytes());
    }

    /// Copies the unread contents of `buf` into the body without mutating the
    /// source.
    pub fn write_buffer(&mut self, buf: &NetBuffer) {
        self.write_bytes(buf.unread_slice());
    }

    /// Opens a scoped inserter whose bytes land before the body. The bytes
    /// are spliced in when the inserter goes out of scope.
    pub fn insert_front(&mut self) -> Inserter<'_> {
        Inserter {
            dst: &mut self.front,
            pool: Rc::clone(&self.pool),
            segments: Vec::new(),
        }
    }

    /// Opens a scoped inserter whose bytes land after the body.
    pub fn insert_back(&mut self) -> Inserter<'_> {
        Inserter {
            dst: &mut self.back,
            pool: Rc::clone(&self.pool),
            segments: Vec::new(),
        }
    }

    /// Total bytes written to the body section.
    pub fn body_len(&self) -> usize {
        self.body.iter().map(NetBuffer::remaining).sum()
    }

    /// Total bytes across all sections.
    pub fn len(&self) -> usize {
        self.front
            .iter()
            .chain(self.body.iter())
            .chain(self.back.iter())
            .map(NetBuffer::remaining)
            .sum()
    }

    /// Finalizes the gather: every non-empty segment is flipped to read mode
    /// and returned in writing order (prepend, body, append). The builder is
    /// left empty. Empty segments go straight back to the pool.
    pub fn build(&mut self) -> Vec<NetBuffer> {
        let mut pool = self.pool.borrow_mut();
        let mut out = Vec::new();

        for mut buf in self
            .front
            .drain(..)
            .chain(self.body.drain(..))
            .chain(self.back.drain(..))
        {
            if buf.is_empty() {
                pool.release(buf);
            } else {
                buf.flip_read();
                out.push(buf);
            }
        }

        out
    }

    /// Releases the body segments only, keeping the prepend and append
    /// sections. Used when a response head must go out without its body.
    pub fn discard_body(&mut self) {
        let mut pool = self.pool.borrow_mut();
        pool.release_all(self.body.drain(..));
    }

    /// Discards all pending segments back into the pool.
    pub fn clear(&mut self) {
        let mut pool = self.pool.borrow_mut();
        pool.release_all(self.front.drain(..));
        pool.release_all(self.body.drain(..));
        pool.release_all(self.back.drain(..));
    }
}

impl Drop for GatherBuilder {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Scoped writer for the prepend/append sections of a [`GatherBuilder`].
/// Dropping the inserter splices its bytes into the owning builder.
pub struct Inserter<'a> {
    dst: &'a mut Vec<NetBuffer>,
    pool: PoolHandle,
    segments: Vec<NetBuffer>,
}

impl<'a> Inserter<'a> {
    pub fn write_bytes(&mut self, src: &[u8]) {
        write_segmented(&mut self.segments, &self.pool, src);
    }

    #[inline]
    pub fn write_str(&mut self, src: &str) {
        self.write_bytes(src.as_bytes());
    }
}

impl<'a> Drop for Inserter<'a> {
    fn drop(&mut self) {
        self.dst.append(&mut self.segments);
    }
}

fn write_segmented(segments: &mut Vec<NetBuffer>, pool: &PoolHandle, mut src: &[u8]) {
    while !src.is_empty() {
        let need_segment = match segments.last() {
            Some(last) => last.is_full(),
            None => true,
        };

        if need_segment {
            segments.push(pool.borrow_mut().allocate());
        }

        let taken = segments
            .last_mut()
            .expect("segment list cannot be empty here")
            .put(src);
        src = &src[taken..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(bufs: &[NetBuffer]) -> Vec<u8> {
        let mut out = Vec::new();
        for buf in bufs {
            out.extend_from_slice(buf.unread_slice());
        }
        out
    }

    #[test]
    fn test_pool_reuses_entries() {
        let mut pool = BufferPool::new(8, 2);

        let a = pool.allocate();
        let tag = a.tag();
        pool.release(a);

        let b = pool.allocate();
        assert_eq!(b.tag(), tag);
        assert!(b.is_cleared());
    }

    #[test]
    fn test_pool_tags_are_monotonic() {
        let mut pool = BufferPool::new(8, 2);

        let a = pool.allocate();
        let b = pool.allocate();
        assert!(b.tag() > a.tag());
    }

    #[test]
    fn test_pool_discards_beyond_capacity() {
        let mut pool = BufferPool::new(8, 1);

        let a = pool.allocate();
        let b = pool.allocate();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_pool_discards_resized_entries() {
        let mut pool = BufferPool::new(8, 4);

        let mut a = pool.allocate();
        a.resize(32);
        pool.release(a);

        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_builder_segments_across_entries() {
        let pool = BufferPool::handle(4, 16);
        let mut builder = GatherBuilder::new(Rc::clone(&pool));

        builder.write_str("0123456789");
        assert_eq!(builder.body_len(), 10);

        let bufs = builder.build();
        assert_eq!(bufs.len(), 3);
        assert_eq!(collect(&bufs), b"0123456789");
    }

    #[test]
    fn test_builder_orders_front_body_back() {
        let pool = BufferPool::handle(16, 16);
        let mut builder = GatherBuilder::new(pool);

        builder.write_str("body");
        {
            let mut front = builder.insert_front();
            front.write_str("head ");
        }
        {
            let mut back = builder.insert_back();
            back.write_str(" tail");
        }

        let bufs = builder.build();
        assert_eq!(collect(&bufs), b"head body tail");
        assert_eq!(builder.len(), 0);
    }

    #[test]
    fn test_builder_copies_source_buffer() {
        let pool = BufferPool::handle(16, 16);
        let mut builder = GatherBuilder::new(pool);

        let mut src = NetBuffer::new(8);
        src.put(b"copy");
        builder.write_buffer(&src);

        // The source keeps its unread bytes.
        assert_eq!(src.remaining(), 4);
        assert_eq!(collect(&builder.build()), b"copy");
    }

    #[test]
    fn test_build_returns_entries_to_pool_when_cleared() {
        let pool = BufferPool::handle(4, 16);
        {
            let mut builder = GatherBuilder::new(Rc::clone(&pool));
            builder.write_str("abcdef");
            builder.clear();
        }
        assert_eq!(pool.borrow().free_count(), 2);
    }
}
