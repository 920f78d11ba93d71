use crate::buffer_pool::PooledBuffer;

pub type ByteCount = u64;

/// A contiguous byte range of the target file that still has to be generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub offset: ByteCount,
    pub length: ByteCount,
}

impl WorkItem {
    pub fn end(&self) -> ByteCount {
        self.offset + self.length
    }
}

/// Generated content for one [`WorkItem`]. Whoever holds it owns the buffer
/// and must hand it back to the pool.
#[derive(Debug)]
pub struct ResultItem {
    pub buffer: PooledBuffer,
    pub offset: ByteCount,
}
