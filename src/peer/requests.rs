//! The outbound request ledger.
//!
//! Tracks, per connection, the requests actually on the wire
//! (`actual_requests`), the tentative next set the scheduler wants
//! (`next_requests`), and the multiset of chunks still considered valid
//! to receive (`valid_receive_chunks`). Every insertion and removal is
//! mirrored in the torrent-wide [`PendingRequests`] refcount, which
//! must never go negative: an underflow is a double-delete bug, not a
//! protocol condition.

use std::collections::HashMap;

use super::message::Message;
use super::state::Peer;
use crate::torrent::Callbacks;

/// A request for one chunk: `(piece, begin, length)`.
///
/// `length` is at most the chunk size; `begin` is chunk-aligned except
/// for the short final chunk of the last piece. Equality is on all
/// three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    pub(crate) fn to_request_message(self) -> Message {
        Message::Request {
            index: self.index,
            begin: self.begin,
            length: self.length,
        }
    }

    pub(crate) fn to_cancel_message(self) -> Message {
        Message::Cancel {
            index: self.index,
            begin: self.begin,
            length: self.length,
        }
    }

    pub(crate) fn to_reject_message(self) -> Message {
        Message::Reject {
            index: self.index,
            begin: self.begin,
            length: self.length,
        }
    }
}

/// Torrent-wide refcount of outstanding requests across all peers.
#[derive(Debug, Default)]
pub struct PendingRequests {
    map: HashMap<BlockRequest, usize>,
}

impl PendingRequests {
    pub fn count(&self, r: BlockRequest) -> usize {
        self.map.get(&r).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn inc(&mut self, r: BlockRequest) {
        *self.map.entry(r).or_insert(0) += 1;
    }

    fn dec(&mut self, r: BlockRequest) {
        match self.map.get_mut(&r) {
            Some(1) => {
                self.map.remove(&r);
            }
            Some(n) if *n > 1 => *n -= 1,
            _ => panic!("pending request count underflow for {:?}", r),
        }
    }
}

/// Why [`Peer::request_block`] declined to issue a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRefusal {
    /// Already at the nominal in-flight cap.
    AtCapacity,
}

impl Peer {
    /// The dynamic cap on outstanding outbound requests: twice the peak
    /// pieces received between request updates, within the peer's
    /// advertised limit, never below one.
    pub fn nominal_max_requests(&self) -> usize {
        (2 * self.max_pieces_received_between_request_updates)
            .clamp(1, self.peer_max_requests.max(1))
    }

    /// Issues a request: ledger insertion, refcount, expecting-chunks
    /// timer, callback, wire message. No-op if already outstanding.
    ///
    /// The caller must have established the request preconditions (peer
    /// has the piece, piece not hashing or queued for hash, connection
    /// open); violations are programmer errors.
    pub(crate) fn request_block(
        &mut self,
        r: BlockRequest,
        pending: &mut PendingRequests,
        callbacks: &Callbacks,
    ) -> Result<bool, RequestRefusal> {
        debug_assert!(!self.closed, "requesting on a closed connection");
        debug_assert!(self.peer_has_piece(r.index), "requesting piece peer doesn't have");
        if self.actual_requests.contains(&r) {
            return Ok(true);
        }
        if self.actual_requests.len() >= self.nominal_max_requests() {
            return Err(RequestRefusal::AtCapacity);
        }
        self.actual_requests.insert(r);
        *self.valid_receive_chunks.entry(r).or_insert(0) += 1;
        pending.inc(r);
        self.update_expecting_chunks();
        if let Some(f) = &callbacks.sent_request {
            f(self.key, r);
        }
        Ok(self.write_message(&r.to_request_message()))
    }

    /// Cancels an outstanding request, sending a wire Cancel if it was
    /// actually on the wire. Safe to call for requests we never made.
    pub(crate) fn cancel_block(
        &mut self,
        r: BlockRequest,
        pending: &mut PendingRequests,
        callbacks: &Callbacks,
    ) -> bool {
        if self.delete_request(r, pending, callbacks) {
            return self.write_message(&r.to_cancel_message());
        }
        true
    }

    /// Removes a request from both the next and actual sets, fixing up
    /// the shared refcount. Returns whether it was actually held.
    pub(crate) fn delete_request(
        &mut self,
        r: BlockRequest,
        pending: &mut PendingRequests,
        callbacks: &Callbacks,
    ) -> bool {
        self.next_requests.remove(&r);
        if !self.actual_requests.remove(&r) {
            return false;
        }
        if let Some(f) = &callbacks.deleted_request {
            f(self.key, r);
        }
        self.update_expecting_chunks();
        pending.dec(r);
        true
    }

    /// Drops the whole outbound set, as on a Choke without the fast
    /// extension or on close.
    pub(crate) fn delete_all_requests(
        &mut self,
        pending: &mut PendingRequests,
        callbacks: &Callbacks,
    ) {
        let outstanding: Vec<BlockRequest> = self.actual_requests.iter().copied().collect();
        for r in outstanding {
            self.delete_request(r, pending, callbacks);
        }
        assert!(self.actual_requests.is_empty());
        self.next_requests.clear();
    }

    /// The remote rejected a request (fast extension): drop it and the
    /// matching expected-receive entry.
    pub(crate) fn remote_rejected_request(
        &mut self,
        r: BlockRequest,
        pending: &mut PendingRequests,
        callbacks: &Callbacks,
    ) {
        if self.delete_request(r, pending, callbacks) {
            self.dec_expected_chunk_receive(r);
        }
    }

    pub(crate) fn dec_expected_chunk_receive(&mut self, r: BlockRequest) {
        match self.valid_receive_chunks.get_mut(&r) {
            Some(1) => {
                self.valid_receive_chunks.remove(&r);
            }
            Some(n) if *n > 1 => *n -= 1,
            _ => panic!("no expected chunk receive outstanding for {:?}", r),
        }
    }
}
