//! Chunk buffer pool.
//!
//! One pool per torrent, sized to the torrent's chunk size. The frame
//! decoder borrows a buffer for every `Piece` payload; the receive path
//! returns it once the chunk has been written out, but only when the
//! payload length matches the chunk size (short final chunks would
//! otherwise shrink pooled capacity).

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;

const POOL_CAPACITY: usize = 512;

pub struct ChunkPool {
    buffers: ArrayQueue<BytesMut>,
    chunk_size: usize,
}

impl ChunkPool {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(POOL_CAPACITY),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Borrows a cleared buffer with at least `chunk_size` capacity.
    pub fn get(&self) -> BytesMut {
        self.buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.chunk_size))
    }

    /// Returns a payload to the pool iff it is exactly chunk-sized and
    /// nothing else still references its allocation.
    pub fn put(&self, payload: Bytes) {
        if payload.len() != self.chunk_size {
            return;
        }
        if let Ok(mut buf) = payload.try_into_mut() {
            buf.clear();
            let _ = self.buffers.push(buf);
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sized_payload_returns() {
        let pool = ChunkPool::new(16);
        let mut buf = pool.get();
        buf.resize(16, 0xAB);
        pool.put(buf.freeze());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn short_payload_is_dropped() {
        let pool = ChunkPool::new(16);
        let mut buf = pool.get();
        buf.resize(7, 0);
        pool.put(buf.freeze());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn shared_payload_is_dropped() {
        let pool = ChunkPool::new(16);
        let mut buf = pool.get();
        buf.resize(16, 0);
        let payload = buf.freeze();
        let _second = payload.clone();
        pool.put(payload);
        assert_eq!(pool.available(), 0);
    }
}
