use bytes::Bytes;

/// A bitfield of piece availability.
///
/// Bits are numbered from the high bit of the first byte, as on the
/// wire. The logical length can grow: a peer may claim pieces by Have
/// before we know the torrent's piece count.
#[derive(Debug, Clone, Default)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Builds a bitfield from wire bytes for a known piece count.
    /// Bytes and bits beyond `piece_count` are discarded.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);
        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets the bit, growing the logical length if needed.
    pub fn set_piece(&mut self, index: usize) {
        self.grow(index + 1);
        self.bits[index / 8] |= 1 << (7 - index % 8);
    }

    pub fn clear_piece(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Ensures the bitfield covers at least `piece_count` pieces.
    pub fn grow(&mut self, piece_count: usize) {
        if piece_count > self.piece_count {
            self.piece_count = piece_count;
            self.bits.resize(piece_count.div_ceil(8), 0);
        }
    }

    /// Shrinks the logical length, discarding bits past `piece_count`.
    pub fn truncate(&mut self, piece_count: usize) {
        if piece_count < self.piece_count {
            self.piece_count = piece_count;
            self.bits.truncate(piece_count.div_ceil(8));
            self.clear_spare_bits();
        }
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Indices of all set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.has_piece(i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear() {
        let mut bf = Bitfield::new(100);
        assert!(!bf.has_piece(0));
        bf.set_piece(0);
        bf.set_piece(99);
        assert!(bf.has_piece(0));
        assert!(bf.has_piece(99));
        bf.clear_piece(0);
        assert!(!bf.has_piece(0));
        assert_eq!(bf.count(), 1);
    }

    #[test]
    fn grows_on_set() {
        let mut bf = Bitfield::new(0);
        bf.set_piece(17);
        assert_eq!(bf.piece_count(), 18);
        assert!(bf.has_piece(17));
        assert!(!bf.has_piece(16));
    }

    #[test]
    fn from_bytes_clears_spare_bits() {
        let bf = Bitfield::from_bytes(&[0xFF, 0xFF], 10);
        assert_eq!(bf.count(), 10);
        assert!(bf.has_piece(9));
        assert!(!bf.has_piece(10));
    }

    #[test]
    fn from_bytes_discards_excess_bytes() {
        let bf = Bitfield::from_bytes(&[0xFF, 0xFF, 0xFF], 4);
        assert_eq!(bf.count(), 4);
        assert_eq!(bf.as_bytes().len(), 1);
    }

    #[test]
    fn truncate_drops_high_bits() {
        let mut bf = Bitfield::from_bytes(&[0xFF], 8);
        bf.truncate(3);
        assert_eq!(bf.count(), 3);
        assert_eq!(bf.piece_count(), 3);
    }

    #[test]
    fn iter_set_ascending() {
        let mut bf = Bitfield::new(16);
        bf.set_piece(3);
        bf.set_piece(11);
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![3, 11]);
    }
}
