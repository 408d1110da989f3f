//! Per-peer piece request ordering.
//!
//! Each connection keeps a priority-ordered set of the pieces it can
//! usefully serve. Ties within a priority break on the peer's piece
//! inclination, a random-but-stable permutation pooled by the torrent,
//! so connections don't all chase the same pieces.

use std::collections::{BTreeSet, HashMap};

/// Download priority of a piece, as set on the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PiecePriority {
    /// Not wanted; never requested.
    None,
    #[default]
    Normal,
    /// Ahead of a reader position.
    Readahead,
    High,
    Now,
}

impl PiecePriority {
    /// BTreeSet sort rank: lower sorts first, so more urgent is lower.
    fn rank(self) -> u8 {
        match self {
            PiecePriority::Now => 0,
            PiecePriority::High => 1,
            PiecePriority::Readahead => 2,
            PiecePriority::Normal => 3,
            PiecePriority::None => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderEntry {
    rank: u8,
    inclination: u32,
    piece: u32,
}

/// A priority-ordered set of piece indices.
#[derive(Debug, Default)]
pub struct RequestOrder {
    entries: BTreeSet<OrderEntry>,
    by_piece: HashMap<u32, OrderEntry>,
}

impl RequestOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or repositions a piece. Returns whether membership or
    /// position changed.
    pub fn set(&mut self, piece: u32, priority: PiecePriority, inclination: u32) -> bool {
        let entry = OrderEntry {
            rank: priority.rank(),
            inclination,
            piece,
        };
        if let Some(old) = self.by_piece.insert(piece, entry) {
            if old == entry {
                return false;
            }
            self.entries.remove(&old);
        }
        self.entries.insert(entry);
        true
    }

    /// Removes a piece. Returns whether it was present.
    pub fn remove(&mut self, piece: u32) -> bool {
        match self.by_piece.remove(&piece) {
            Some(entry) => {
                self.entries.remove(&entry);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, piece: u32) -> bool {
        self.by_piece.contains_key(&piece)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_piece.clear();
    }

    /// Pieces in request order: most urgent first, inclination within a
    /// priority, index as the final tiebreak.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|e| e.piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_priority_then_inclination() {
        let mut order = RequestOrder::new();
        order.set(0, PiecePriority::Normal, 5);
        order.set(1, PiecePriority::High, 9);
        order.set(2, PiecePriority::Normal, 1);
        assert_eq!(order.iter().collect::<Vec<_>>(), vec![1, 2, 0]);
    }

    #[test]
    fn set_reports_changes() {
        let mut order = RequestOrder::new();
        assert!(order.set(3, PiecePriority::Normal, 7));
        assert!(!order.set(3, PiecePriority::Normal, 7));
        assert!(order.set(3, PiecePriority::High, 7));
        assert_eq!(order.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut order = RequestOrder::new();
        order.set(3, PiecePriority::Normal, 7);
        assert!(order.remove(3));
        assert!(!order.remove(3));
        assert!(order.is_empty());
    }
}
