//! The storage collaborator consumed by the connection core.
//!
//! Piece storage and hashing live outside this crate; the core only
//! needs to read chunks for uploads, write received chunks, and ask
//! whether a piece survives in storage. Reads and writes are performed
//! with the torrent lock released: writes inline on the reader task,
//! reads on blocking worker threads.

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read/write beyond torrent bounds at offset {0}")]
    OutOfBounds(u64),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Blocking piece storage.
pub trait Storage: Send + Sync {
    /// Reads `len` bytes at an absolute torrent offset.
    fn read(&self, offset: u64, len: u32) -> Result<Bytes, StorageError>;

    /// Writes chunk data at `begin` within `piece`.
    fn write(&self, piece: u32, begin: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Whether the backend still holds a verified copy of `piece`.
    /// Pieces can be dropped from storage behind our back.
    fn piece_complete(&self, piece: u32) -> bool;
}

/// In-memory storage over a single contiguous buffer.
///
/// Intended for tests and seeding small payloads from memory.
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
    piece_length: u64,
    complete: Mutex<Vec<bool>>,
}

impl MemoryStorage {
    pub fn new(total_length: u64, piece_length: u64) -> Self {
        let num_pieces = if piece_length == 0 {
            0
        } else {
            total_length.div_ceil(piece_length) as usize
        };
        Self {
            data: Mutex::new(vec![0; total_length as usize]),
            piece_length,
            complete: Mutex::new(vec![false; num_pieces]),
        }
    }

    /// Builds storage already holding `content`, all pieces complete.
    pub fn seeded(content: &[u8], piece_length: u64) -> Self {
        let storage = Self::new(content.len() as u64, piece_length);
        storage.data.lock().copy_from_slice(content);
        storage.complete.lock().fill(true);
        storage
    }

    pub fn mark_complete(&self, piece: u32) {
        if let Some(slot) = self.complete.lock().get_mut(piece as usize) {
            *slot = true;
        }
    }

    pub fn mark_dropped(&self, piece: u32) {
        if let Some(slot) = self.complete.lock().get_mut(piece as usize) {
            *slot = false;
        }
    }

    pub fn piece_data(&self, piece: u32) -> Bytes {
        let data = self.data.lock();
        let start = (piece as u64 * self.piece_length) as usize;
        let end = (start + self.piece_length as usize).min(data.len());
        Bytes::copy_from_slice(&data[start..end])
    }
}

impl Storage for MemoryStorage {
    fn read(&self, offset: u64, len: u32) -> Result<Bytes, StorageError> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= data.len())
            .ok_or(StorageError::OutOfBounds(offset))?;
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    fn write(&self, piece: u32, begin: u32, chunk: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.lock();
        let offset = piece as u64 * self.piece_length + begin as u64;
        let start = offset as usize;
        let end = start
            .checked_add(chunk.len())
            .filter(|&end| end <= data.len())
            .ok_or(StorageError::OutOfBounds(offset))?;
        data[start..end].copy_from_slice(chunk);
        Ok(())
    }

    fn piece_complete(&self, piece: u32) -> bool {
        self.complete
            .lock()
            .get(piece as usize)
            .copied()
            .unwrap_or(false)
    }
}

/// A storage wrapper that fails every operation; for error-path tests.
#[cfg(test)]
pub(crate) struct FailingStorage;

#[cfg(test)]
impl Storage for FailingStorage {
    fn read(&self, offset: u64, _len: u32) -> Result<Bytes, StorageError> {
        Err(StorageError::OutOfBounds(offset))
    }

    fn write(&self, _piece: u32, _begin: u32, _data: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::Backend("write refused".into()))
    }

    fn piece_complete(&self, _piece: u32) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let storage = MemoryStorage::new(64, 16);
        storage.write(1, 4, b"abcd").unwrap();
        assert_eq!(&storage.read(20, 4).unwrap()[..], b"abcd");
    }

    #[test]
    fn out_of_bounds_read() {
        let storage = MemoryStorage::new(64, 16);
        assert!(storage.read(60, 8).is_err());
    }

    #[test]
    fn seeded_pieces_are_complete() {
        let storage = MemoryStorage::seeded(&[0xAA; 48], 16);
        assert!(storage.piece_complete(0));
        assert!(storage.piece_complete(2));
        storage.mark_dropped(2);
        assert!(!storage.piece_complete(2));
    }
}
