//! Torrent-side shared state consumed by the peer connection core.
//!
//! All mutable state for a torrent and its peers lives in
//! [`TorrentState`] behind one lock. Connection tasks acquire it to
//! dispatch messages and fill write buffers, and release it across
//! every blocking operation: socket reads and writes, storage I/O, and
//! rate-limiter sleeps.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use sha1::{Digest, Sha1};
use tokio::sync::Notify;
use tracing::warn;

use crate::bandwidth::{BandwidthLimiter, RateLimiter};
use crate::config::{Config, MAX_METADATA_SIZE};
use crate::peer::{
    metadata_piece_count, metadata_piece_len, Bitfield, BlockRequest, ExtensionHandshake, Message,
    Peer, PeerError, PeerId, PeerKey, PendingRequests, PiecePriority, METADATA_PIECE_SIZE,
};
use crate::pex::PexPeer;
use crate::pool::ChunkPool;
use crate::storage::{Storage, StorageError};

/// A DHT node the Port message forwards peer ports to.
pub trait DhtServer: Send + Sync {
    fn ping(&self, addr: SocketAddr);
}

/// Hooks fired at connection-lifecycle boundaries.
///
/// Callbacks run while the torrent lock is held and must not call back
/// into the torrent.
#[derive(Default)]
pub struct Callbacks {
    pub sent_request: Option<Box<dyn Fn(PeerKey, BlockRequest) + Send + Sync>>,
    pub deleted_request: Option<Box<dyn Fn(PeerKey, BlockRequest) + Send + Sync>>,
    pub received_requested: Option<Box<dyn Fn(PeerKey, BlockRequest) + Send + Sync>>,
    pub received_useful_data: Option<Box<dyn Fn(PeerKey, BlockRequest) + Send + Sync>>,
    pub read_message: Option<Box<dyn Fn(PeerKey, &Message) + Send + Sync>>,
    pub read_extended_handshake: Option<Box<dyn Fn(PeerKey, &ExtensionHandshake) + Send + Sync>>,
    pub peer_closed: Option<Box<dyn Fn(PeerKey) + Send + Sync>>,
    pub peer_conn_closed: Option<Box<dyn Fn(PeerKey) + Send + Sync>>,
    pub write_error: Option<Box<dyn Fn(&StorageError) + Send + Sync>>,
    pub discovered_peers: Option<Box<dyn Fn(&[PexPeer]) + Send + Sync>>,
}

/// Torrent layout numbers, known once the info dictionary is.
#[derive(Debug, Clone, Copy)]
pub struct TorrentInfo {
    pub total_length: u64,
    pub piece_length: u64,
    pub num_pieces: u32,
}

impl TorrentInfo {
    pub fn new(total_length: u64, piece_length: u64) -> Self {
        let num_pieces = if piece_length == 0 {
            0
        } else {
            total_length.div_ceil(piece_length) as u32
        };
        Self {
            total_length,
            piece_length,
            num_pieces,
        }
    }
}

#[derive(Debug)]
struct PieceState {
    /// Chunks received but not yet hash-verified.
    dirty_chunks: Bitfield,
    /// Storage writes in flight for this piece.
    pending_writes: u32,
    /// Peers that contributed chunk data since the last hash.
    dirtiers: std::collections::HashSet<PeerKey>,
    hashing: bool,
    queued_for_hash: bool,
    priority: PiecePriority,
}

impl PieceState {
    fn new(num_chunks: usize) -> Self {
        Self {
            dirty_chunks: Bitfield::new(num_chunks),
            pending_writes: 0,
            dirtiers: Default::default(),
            hashing: false,
            queued_for_hash: false,
            priority: PiecePriority::Normal,
        }
    }
}

/// Metadata (info-dictionary) acquisition state for ut_metadata.
#[derive(Debug, Default)]
struct MetadataState {
    size: Option<usize>,
    have_pieces: Vec<bool>,
    bytes: Vec<u8>,
    /// Set once the accumulated bytes hash to the info hash.
    info_bytes: Option<Bytes>,
}

/// Everything the torrent lock protects.
pub struct TorrentState {
    pub(crate) config: Arc<Config>,
    pub(crate) callbacks: Arc<Callbacks>,
    info_hash: [u8; 20],
    pub(crate) local_peer_id: PeerId,

    info: Option<TorrentInfo>,
    chunk_size: u32,
    completed: Bitfield,
    pieces: Vec<PieceState>,
    availability: Vec<u32>,
    pub(crate) pending: PendingRequests,

    pub(crate) peers: HashMap<PeerKey, Peer>,
    next_peer_key: PeerKey,
    inclination_pool: Vec<Vec<u32>>,

    metadata: MetadataState,
    hash_queue: VecDeque<u32>,
    dht_servers: Vec<Arc<dyn DhtServer>>,
    discovered: Vec<PexPeer>,
    pub(crate) closed: bool,
}

impl TorrentState {
    pub fn have_info(&self) -> bool {
        self.info.is_some()
    }

    pub fn num_pieces(&self) -> Option<u32> {
        self.info.as_ref().map(|i| i.num_pieces)
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Length of piece `index`; the final piece may be short.
    pub fn piece_length(&self, index: u32) -> u64 {
        let info = self.info.as_ref().expect("piece length without info");
        let start = index as u64 * info.piece_length;
        info.piece_length.min(info.total_length - start)
    }

    pub fn chunks_in_piece(&self, index: u32) -> u32 {
        self.piece_length(index).div_ceil(self.chunk_size as u64) as u32
    }

    /// The request naming chunk `chunk` of `piece`.
    pub fn chunk_request(&self, piece: u32, chunk: u32) -> BlockRequest {
        let begin = chunk as u64 * self.chunk_size as u64;
        let length = (self.chunk_size as u64).min(self.piece_length(piece) - begin);
        BlockRequest::new(piece, begin as u32, length as u32)
    }

    fn chunk_index(&self, r: BlockRequest) -> u32 {
        r.begin / self.chunk_size
    }

    pub fn have_piece(&self, index: u32) -> bool {
        self.completed.has_piece(index as usize)
    }

    /// A copy of the completion bitmap.
    pub fn completed_snapshot(&self) -> Bitfield {
        self.completed.clone()
    }

    /// Absolute torrent offset of a request's first byte.
    pub fn request_abs_offset(&self, r: BlockRequest) -> u64 {
        let info = self.info.as_ref().expect("offset without info");
        r.index as u64 * info.piece_length + r.begin as u64
    }

    /// Drops a piece from the completion cache after storage lost it.
    pub(crate) fn clear_piece_complete(&mut self, index: u32) {
        self.completed.clear_piece(index as usize);
    }

    /// Whether we already hold this chunk: the piece is complete, or
    /// the chunk is dirty (received, awaiting verification).
    pub fn have_chunk(&self, r: BlockRequest) -> bool {
        if !self.have_info() {
            return false;
        }
        if self.have_piece(r.index) {
            return true;
        }
        self.pieces[r.index as usize]
            .dirty_chunks
            .has_piece(self.chunk_index(r) as usize)
    }

    /// All pieces complete. A zero-length torrent is complete from the
    /// start.
    pub fn seeding(&self) -> bool {
        self.have_info() && self.completed.is_full()
    }

    pub fn hashing(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.hashing)
    }

    pub fn queued_for_hash(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.queued_for_hash)
    }

    pub fn piece_availability(&self, index: u32) -> u32 {
        self.availability
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn inc_piece_availability(&mut self, index: u32) {
        if let Some(slot) = self.availability.get_mut(index as usize) {
            *slot += 1;
        }
    }

    pub(crate) fn dec_piece_availability(&mut self, index: u32) {
        match self.availability.get_mut(index as usize) {
            Some(0) => panic!("piece {} availability underflow", index),
            Some(slot) => *slot -= 1,
            None => {}
        }
    }

    pub(crate) fn set_chunk_dirty(&mut self, r: BlockRequest) {
        let chunk = self.chunk_index(r);
        self.pieces[r.index as usize]
            .dirty_chunks
            .set_piece(chunk as usize);
    }

    pub(crate) fn clear_chunk_dirty(&mut self, r: BlockRequest) {
        let chunk = self.chunk_index(r);
        self.pieces[r.index as usize]
            .dirty_chunks
            .clear_piece(chunk as usize);
    }

    pub fn piece_all_dirty(&self, index: u32) -> bool {
        let chunks = self.chunks_in_piece(index) as usize;
        chunks > 0 && self.pieces[index as usize].dirty_chunks.count() == chunks
    }

    pub(crate) fn inc_pending_writes(&mut self, index: u32) {
        self.pieces[index as usize].pending_writes += 1;
    }

    pub(crate) fn dec_pending_writes(&mut self, index: u32) {
        let p = &mut self.pieces[index as usize];
        assert!(p.pending_writes > 0, "pending writes underflow");
        p.pending_writes -= 1;
    }

    pub(crate) fn pending_writes(&self, index: u32) -> u32 {
        self.pieces[index as usize].pending_writes
    }

    #[cfg(test)]
    pub(crate) fn piece_dirtier_count(&self, index: u32) -> usize {
        self.pieces[index as usize].dirtiers.len()
    }

    pub(crate) fn mark_dirtied_by(&mut self, index: u32, key: PeerKey) {
        self.pieces[index as usize].dirtiers.insert(key);
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.peer_touched_pieces.insert(index);
        }
    }

    /// Queues a hash check for a fully-dirty piece. The owner drains
    /// the queue with [`Torrent::pop_queued_hash_check`] and reports
    /// back through [`Torrent::piece_hashed`].
    pub(crate) fn queue_piece_check(&mut self, index: u32) {
        let p = &mut self.pieces[index as usize];
        if p.queued_for_hash || p.hashing {
            return;
        }
        p.queued_for_hash = true;
        self.hash_queue.push_back(index);
    }

    pub(crate) fn pop_queued_hash_check(&mut self) -> Option<u32> {
        let index = self.hash_queue.pop_front()?;
        let p = &mut self.pieces[index as usize];
        p.queued_for_hash = false;
        p.hashing = true;
        Some(index)
    }

    /// Applies a hash-check verdict.
    ///
    /// Success completes the piece: dirtier stats credit, Haves to every
    /// connection, requests for the piece cancelled, priorities updated.
    /// Failure unpends every chunk and clears the dirtier set so the
    /// piece can be re-downloaded.
    pub(crate) fn piece_hashed(&mut self, index: u32, ok: bool) {
        let p = &mut self.pieces[index as usize];
        p.hashing = false;
        p.queued_for_hash = false;
        let dirtiers = std::mem::take(&mut p.dirtiers);
        for key in &dirtiers {
            if let Some(peer) = self.peers.get_mut(key) {
                if ok {
                    peer.stats.pieces_dirtied_good += 1;
                } else {
                    peer.stats.pieces_dirtied_bad += 1;
                }
            }
        }
        if ok {
            self.completed.set_piece(index as usize);
            self.on_piece_completed(index);
        } else {
            self.pieces[index as usize].dirty_chunks.clear_all();
        }
    }

    /// Marks a piece complete without a hash round trip, as when
    /// loading verified resume data.
    pub(crate) fn set_piece_complete(&mut self, index: u32) {
        if !self.completed.has_piece(index as usize) {
            self.completed.set_piece(index as usize);
            self.on_piece_completed(index);
        }
    }

    fn on_piece_completed(&mut self, index: u32) {
        let callbacks = self.callbacks.clone();
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            let Some(peer) = self.peers.get_mut(&key) else {
                continue;
            };
            let stale: Vec<BlockRequest> = peer
                .actual_requests
                .iter()
                .filter(|r| r.index == index)
                .copied()
                .collect();
            for r in stale {
                peer.cancel_block(r, &mut self.pending, &callbacks);
            }
            peer.have(index);
            self.update_piece_priority(key, index);
            self.update_peer_requests(key);
            self.maybe_drop_mutually_complete_peer(key);
        }
    }

    pub(crate) fn piece_priority(&self, index: u32) -> PiecePriority {
        if self.completed.has_piece(index as usize) {
            return PiecePriority::None;
        }
        self.pieces
            .get(index as usize)
            .map(|p| p.priority)
            .unwrap_or(PiecePriority::None)
    }

    pub(crate) fn set_piece_priority(&mut self, index: u32, priority: PiecePriority) {
        let Some(p) = self.pieces.get_mut(index as usize) else {
            return;
        };
        if p.priority == priority {
            return;
        }
        p.priority = priority;
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            if self.update_piece_priority(key, index) {
                self.update_peer_requests(key);
            }
        }
    }

    fn ensure_inclination(&mut self, key: PeerKey, num_pieces: u32) {
        let needs = self
            .peers
            .get(&key)
            .is_some_and(|p| p.inclination.is_none());
        if !needs {
            return;
        }
        let perm = match self.inclination_pool.pop() {
            Some(perm) if perm.len() == num_pieces as usize => perm,
            _ => {
                use rand::seq::SliceRandom;
                let mut perm: Vec<u32> = (0..num_pieces).collect();
                perm.shuffle(&mut rand::rng());
                perm
            }
        };
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.inclination = Some(perm);
        }
    }

    /// Recomputes whether `piece` belongs in the peer's request order.
    /// Returns true iff membership or position changed.
    ///
    /// Connection piece priority is distinct from torrent priority: the
    /// inclination tiebreak stops every connection requesting the same
    /// pieces.
    pub(crate) fn update_piece_priority(&mut self, key: PeerKey, piece: u32) -> bool {
        let Some(info) = self.info else { return false };
        if piece >= info.num_pieces {
            return false;
        }
        let tpp = self.piece_priority(piece);
        self.ensure_inclination(key, info.num_pieces);
        let Some(peer) = self.peers.get_mut(&key) else {
            return false;
        };
        let prio = if peer.peer_has_piece(piece) {
            tpp
        } else {
            PiecePriority::None
        };
        if prio == PiecePriority::None {
            peer.request_order.remove(piece)
        } else {
            let inclination = peer
                .inclination
                .as_ref()
                .and_then(|v| v.get(piece as usize).copied())
                .unwrap_or(piece);
            peer.request_order.set(piece, prio, inclination)
        }
    }

    /// Recomputes the whole request order after bulk claim changes
    /// (Bitfield, HaveAll, HaveNone, info arrival).
    pub(crate) fn peer_pieces_changed(&mut self, key: PeerKey) {
        if let Some(num) = self.num_pieces() {
            let mut changed = false;
            for piece in 0..num {
                if self.update_piece_priority(key, piece) {
                    changed = true;
                }
            }
            if changed {
                self.update_peer_requests(key);
            }
        }
        self.maybe_drop_mutually_complete_peer(key);
    }

    /// Recomputes request-order membership for every piece of every
    /// peer. One pass is O(num_pieces) per peer.
    pub(crate) fn update_all_piece_priorities(&mut self) {
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            let mut changed = false;
            if let Some(num) = self.num_pieces() {
                for piece in 0..num {
                    if self.update_piece_priority(key, piece) {
                        changed = true;
                    }
                }
            }
            if changed {
                self.update_peer_requests(key);
            }
        }
    }

    /// Rebuilds the peer's tentative next request set from its request
    /// order and wakes the writer to converge the wire state toward it.
    pub(crate) fn update_peer_requests(&mut self, key: PeerKey) {
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        if peer.closed {
            return;
        }
        peer.max_pieces_received_between_request_updates = peer
            .max_pieces_received_between_request_updates
            .max(peer.pieces_received_since_last_request_update);
        peer.pieces_received_since_last_request_update = 0;
        let nominal = peer.nominal_max_requests();
        let order: Vec<u32> = peer.request_order.iter().collect();
        let actual = peer.actual_requests.clone();

        let mut desired = std::collections::HashSet::new();
        'pieces: for piece in order {
            if self.hashing(piece) || self.queued_for_hash(piece) {
                continue;
            }
            for chunk in 0..self.chunks_in_piece(piece) {
                let r = self.chunk_request(piece, chunk);
                if self.have_chunk(r) {
                    continue;
                }
                // Keep what we already have in flight; otherwise avoid
                // chunks some other peer is already fetching.
                if actual.contains(&r) || self.pending.count(r) == 0 {
                    desired.insert(r);
                    if desired.len() >= nominal {
                        break 'pieces;
                    }
                }
            }
        }

        let peer = self.peers.get_mut(&key).expect("peer vanished");
        peer.next_interested = !desired.is_empty();
        peer.next_requests = desired;
        peer.write_notify.notify_one();
    }

    /// Drops seed-to-seed connections that can no longer be useful.
    pub(crate) fn maybe_drop_mutually_complete_peer(&mut self, key: PeerKey) {
        if !self.config.drop_mutually_complete_peers || !self.seeding() {
            return;
        }
        let Some(peer) = self.peers.get(&key) else {
            return;
        };
        if peer.closed {
            return;
        }
        let (all, known) = peer.peer_has_all_pieces(self.num_pieces());
        if known && all {
            self.close_peer(key);
        }
    }

    /// Tears a peer down exactly once: ledger drained (decrementing the
    /// shared refcounts), availability contribution subtracted, piece
    /// inclination returned to the pool, request order cleared, PEX
    /// closed, both tasks woken, callbacks fired, record removed.
    pub(crate) fn close_peer(&mut self, key: PeerKey) {
        let callbacks = self.callbacks.clone();
        let num = self.num_pieces();
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        if peer.closed {
            return;
        }
        peer.closed = true;
        peer.closed_flag.store(true, Ordering::SeqCst);
        peer.delete_all_requests(&mut self.pending, &callbacks);
        let claims = peer.claimed_pieces(num);
        if let Some(inclination) = peer.inclination.take() {
            self.inclination_pool.push(inclination);
        }
        peer.request_order.clear();
        peer.pex.close();
        peer.write_notify.notify_waiters();
        peer.closed_notify.notify_waiters();
        if self.have_info() {
            for piece in claims.iter_set() {
                self.dec_piece_availability(piece as u32);
            }
        }
        if let Some(f) = &callbacks.peer_closed {
            f(key);
        }
        if let Some(f) = &callbacks.peer_conn_closed {
            f(key);
        }
        self.peers.remove(&key);
    }

    pub(crate) fn alloc_peer_key(&mut self) -> PeerKey {
        let key = self.next_peer_key;
        self.next_peer_key += 1;
        key
    }

    /// Connected, dialable peers as PEX entries.
    pub(crate) fn live_pex_peers(&self, except: PeerKey) -> Vec<PexPeer> {
        self.peers
            .values()
            .filter(|p| !p.closed && p.key != except)
            .map(|p| {
                let mut flags = p.pex_flags();
                let (all, known) = p.peer_has_all_pieces(self.num_pieces());
                flags.seed = known && all;
                PexPeer {
                    addr: p.dial_addr(),
                    flags,
                }
            })
            .collect()
    }

    pub(crate) fn push_discovered(&mut self, peers: Vec<PexPeer>) {
        if let Some(f) = &self.callbacks.discovered_peers {
            f(&peers);
        }
        self.discovered.extend(peers);
    }

    pub(crate) fn dht_servers(&self) -> &[Arc<dyn DhtServer>] {
        &self.dht_servers
    }

    // ---- metadata exchange ----

    pub fn metadata_size(&self) -> Option<usize> {
        self.metadata.size
    }

    /// Records the metadata size signalled in an extension handshake.
    /// Fails on oversized or inconsistent signals.
    pub(crate) fn set_metadata_size(&mut self, size: usize) -> Result<(), PeerError> {
        if size == 0 || size > MAX_METADATA_SIZE {
            return Err(PeerError::BadMetadataSize(format!("{} bytes", size)));
        }
        match self.metadata.size {
            Some(existing) if existing != size => Err(PeerError::BadMetadataSize(format!(
                "{} conflicts with known size {}",
                size, existing
            ))),
            Some(_) => Ok(()),
            None => {
                self.metadata.size = Some(size);
                self.metadata.bytes = vec![0; size];
                self.metadata.have_pieces = vec![false; metadata_piece_count(size)];
                Ok(())
            }
        }
    }

    pub fn metadata_piece_count(&self) -> usize {
        self.metadata.size.map(metadata_piece_count).unwrap_or(0)
    }

    pub fn have_metadata_piece(&self, index: usize) -> bool {
        self.metadata.have_pieces.get(index).copied().unwrap_or(false)
    }

    pub fn have_all_metadata_pieces(&self) -> bool {
        !self.metadata.have_pieces.is_empty() && self.metadata.have_pieces.iter().all(|&b| b)
    }

    /// The raw metadata buffer as accumulated so far.
    pub fn metadata_bytes(&self) -> &[u8] {
        &self.metadata.bytes
    }

    /// The verified info-dictionary bytes, once the exchange completed.
    pub fn info_bytes(&self) -> Option<&Bytes> {
        self.metadata.info_bytes.as_ref()
    }

    /// Accepts one metadata piece. Returns true when this completed and
    /// verified the metadata. A hash mismatch discards all pieces so
    /// the exchange can restart, keeping the size.
    pub(crate) fn got_metadata_piece(
        &mut self,
        piece: u32,
        data: &[u8],
    ) -> Result<bool, PeerError> {
        let size = self
            .metadata
            .size
            .ok_or_else(|| PeerError::Extension("metadata data before size".into()))?;
        let expected = metadata_piece_len(piece, size);
        if expected == 0 || data.len() != expected {
            return Err(PeerError::Extension(format!(
                "metadata piece {} has length {}, want {}",
                piece,
                data.len(),
                expected
            )));
        }
        if self.have_metadata_piece(piece as usize) {
            return Ok(false);
        }
        let offset = piece as usize * METADATA_PIECE_SIZE;
        self.metadata.bytes[offset..offset + data.len()].copy_from_slice(data);
        self.metadata.have_pieces[piece as usize] = true;
        if !self.have_all_metadata_pieces() {
            return Ok(false);
        }
        let digest = Sha1::digest(&self.metadata.bytes);
        if digest.as_slice() == self.info_hash.as_slice() {
            self.metadata.info_bytes = Some(Bytes::copy_from_slice(&self.metadata.bytes));
            Ok(true)
        } else {
            warn!("metadata failed info-hash verification, restarting exchange");
            self.metadata.have_pieces.fill(false);
            Ok(false)
        }
    }

    /// A metadata piece to serve to a peer, available only once our own
    /// copy is verified.
    pub(crate) fn metadata_piece_data(&self, piece: u32) -> Option<Bytes> {
        let info_bytes = self.metadata.info_bytes.as_ref()?;
        let len = metadata_piece_len(piece, info_bytes.len());
        if len == 0 {
            return None;
        }
        let offset = piece as usize * METADATA_PIECE_SIZE;
        Some(info_bytes.slice(offset..offset + len))
    }

    /// Installs torrent layout numbers, sizing the per-piece state and
    /// reconciling availability with claims peers made before the info
    /// was known.
    pub(crate) fn set_info(&mut self, info: TorrentInfo) {
        assert!(self.info.is_none(), "torrent info already set");
        let num = info.num_pieces as usize;
        self.completed = Bitfield::new(num);
        self.availability = vec![0; num];
        self.info = Some(info);
        self.pieces = (0..num as u32)
            .map(|i| PieceState::new(self.chunks_in_piece(i) as usize))
            .collect();

        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            let Some(peer) = self.peers.get_mut(&key) else {
                continue;
            };
            peer.peer_pieces.truncate(num);
            let claims = peer.claimed_pieces(Some(num as u32));
            for piece in claims.iter_set() {
                self.availability[piece] += 1;
            }
            self.peer_pieces_changed(key);
        }
    }
}

/// Parameters for [`Torrent::new`].
pub struct TorrentParams {
    pub info_hash: [u8; 20],
    pub local_peer_id: PeerId,
    pub config: Config,
    pub callbacks: Callbacks,
    pub storage: Arc<dyn Storage>,
    /// Layout numbers if already known (torrent file); magnet opens
    /// pass `None` and acquire them via ut_metadata.
    pub info: Option<TorrentInfo>,
    pub chunk_size: Option<u32>,
    pub limits: BandwidthLimiter,
}

/// One torrent and the shared infrastructure its connections use.
pub struct Torrent {
    state: Mutex<TorrentState>,
    /// Broadcast on chunk writes, metadata progress, and piece changes.
    event: Notify,
    pub(crate) chunk_pool: Arc<ChunkPool>,
    pub(crate) upload_limiter: Arc<RateLimiter>,
    pub(crate) download_limiter: Arc<RateLimiter>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) config: Arc<Config>,
    info_hash: [u8; 20],
}

impl Torrent {
    pub fn new(params: TorrentParams) -> Arc<Self> {
        let chunk_size = params.chunk_size.unwrap_or(crate::config::DEFAULT_CHUNK_SIZE);
        assert!(chunk_size > 0, "chunk size must be nonzero");
        let config = Arc::new(params.config);
        let mut state = TorrentState {
            config: config.clone(),
            callbacks: Arc::new(params.callbacks),
            info_hash: params.info_hash,
            local_peer_id: params.local_peer_id,
            info: None,
            chunk_size,
            completed: Bitfield::new(0),
            pieces: Vec::new(),
            availability: Vec::new(),
            pending: PendingRequests::default(),
            peers: HashMap::new(),
            next_peer_key: 0,
            inclination_pool: Vec::new(),
            metadata: MetadataState::default(),
            hash_queue: VecDeque::new(),
            dht_servers: Vec::new(),
            discovered: Vec::new(),
            closed: false,
        };
        if let Some(info) = params.info {
            state.set_info(info);
        }
        Arc::new(Self {
            state: Mutex::new(state),
            event: Notify::new(),
            chunk_pool: Arc::new(ChunkPool::new(chunk_size as usize)),
            upload_limiter: params.limits.upload,
            download_limiter: params.limits.download,
            storage: params.storage,
            config,
            info_hash: params.info_hash,
        })
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TorrentState> {
        self.state.lock()
    }

    /// The torrent event broadcast; woken after chunk writes and
    /// metadata progress.
    pub fn event(&self) -> &Notify {
        &self.event
    }

    pub(crate) fn broadcast_event(&self) {
        self.event.notify_waiters();
    }

    pub fn have_info(&self) -> bool {
        self.lock().have_info()
    }

    pub fn num_pieces(&self) -> Option<u32> {
        self.lock().num_pieces()
    }

    pub fn is_complete(&self) -> bool {
        self.lock().seeding()
    }

    pub fn piece_availability(&self, index: u32) -> u32 {
        self.lock().piece_availability(index)
    }

    pub fn set_info(&self, info: TorrentInfo) {
        self.lock().set_info(info);
        self.broadcast_event();
    }

    pub fn set_piece_priority(&self, index: u32, priority: PiecePriority) {
        self.lock().set_piece_priority(index, priority);
    }

    pub fn update_all_piece_priorities(&self) {
        self.lock().update_all_piece_priorities();
    }

    pub fn set_piece_complete(&self, index: u32) {
        self.lock().set_piece_complete(index);
        self.broadcast_event();
    }

    /// Next piece awaiting a hash check, marking it hashing.
    pub fn pop_queued_hash_check(&self) -> Option<u32> {
        self.lock().pop_queued_hash_check()
    }

    /// Reports a hash-check verdict for a piece.
    pub fn piece_hashed(&self, index: u32, ok: bool) {
        self.lock().piece_hashed(index, ok);
        self.broadcast_event();
    }

    pub fn metadata_size(&self) -> Option<usize> {
        self.lock().metadata_size()
    }

    pub fn have_all_metadata_pieces(&self) -> bool {
        self.lock().have_all_metadata_pieces()
    }

    pub fn metadata_bytes(&self) -> Vec<u8> {
        self.lock().metadata_bytes().to_vec()
    }

    pub fn info_bytes(&self) -> Option<Bytes> {
        self.lock().info_bytes().cloned()
    }

    pub fn add_dht_server(&self, server: Arc<dyn DhtServer>) {
        self.lock().dht_servers.push(server);
    }

    /// Drains peers learned through PEX since the last call.
    pub fn drain_discovered_peers(&self) -> Vec<PexPeer> {
        std::mem::take(&mut self.lock().discovered)
    }

    /// Closes the torrent and all its connections.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let keys: Vec<PeerKey> = state.peers.keys().copied().collect();
        for key in keys {
            state.close_peer(key);
        }
        drop(state);
        self.broadcast_event();
    }
}

/// Maps a byte offset in the torrent to the chunk request covering it.
///
/// `None` for negative offsets, offsets at or past the torrent length,
/// and degenerate layouts. The final chunk of the last piece may be
/// short.
pub fn offset_to_request(
    total_length: u64,
    piece_length: u64,
    chunk_size: u32,
    offset: i64,
) -> Option<BlockRequest> {
    if offset < 0 || piece_length == 0 || chunk_size == 0 {
        return None;
    }
    let offset = offset as u64;
    if offset >= total_length {
        return None;
    }
    let index = offset / piece_length;
    let begin = offset % piece_length / chunk_size as u64 * chunk_size as u64;
    let piece_len = piece_length.min(total_length - index * piece_length);
    let length = (chunk_size as u64).min(piece_len - begin);
    Some(BlockRequest::new(index as u32, begin as u32, length as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Offsets against a 450 MiB-ish torrent with 256 KiB pieces.
    #[test]
    fn offset_to_request_boundaries() {
        const S: u64 = 472_183_431;
        let case = |off: i64| offset_to_request(S, 1 << 18, 16384, off);

        assert_eq!(case(-1), None);
        assert_eq!(case(0), Some(BlockRequest::new(0, 0, 16384)));
        assert_eq!(case(1), Some(BlockRequest::new(0, 0, 16384)));
        assert_eq!(case(16383), Some(BlockRequest::new(0, 0, 16384)));
        assert_eq!(case(16384), Some(BlockRequest::new(0, 16384, 16384)));
        assert_eq!(
            case((1 << 18) - 1),
            Some(BlockRequest::new(0, (1 << 18) - 16384, 16384))
        );
        assert_eq!(case(472 << 20), None);

        // One before the end of the torrent; the chunk runs short.
        let s = S as i64 - 1;
        let expected = BlockRequest::new(
            (s as u64 / (1 << 18)) as u32,
            (s as u64 % (1 << 18) / 16384 * 16384) as u32,
            12935,
        );
        assert_eq!(case(s), Some(expected));
    }

    #[test]
    fn zero_length_torrent_is_complete() {
        let info = TorrentInfo::new(0, 0);
        assert_eq!(info.num_pieces, 0);
        let torrent = Torrent::new(TorrentParams {
            info_hash: [0; 20],
            local_peer_id: PeerId::generate(),
            config: Config::default(),
            callbacks: Callbacks::default(),
            storage: Arc::new(crate::storage::MemoryStorage::new(0, 0)),
            info: Some(info),
            chunk_size: None,
            limits: BandwidthLimiter::unlimited(),
        });
        assert!(torrent.have_info());
        assert!(torrent.is_complete());
    }

    #[test]
    fn last_piece_length_is_short() {
        let torrent = Torrent::new(TorrentParams {
            info_hash: [0; 20],
            local_peer_id: PeerId::generate(),
            config: Config::default(),
            callbacks: Callbacks::default(),
            storage: Arc::new(crate::storage::MemoryStorage::new(0, 0)),
            info: Some(TorrentInfo::new(472_183_431, 1 << 18)),
            chunk_size: None,
            limits: BandwidthLimiter::unlimited(),
        });
        let state = torrent.lock();
        let num = state.num_pieces().unwrap();
        assert_eq!(state.piece_length(0), 1 << 18);
        let last = state.piece_length(num - 1);
        assert!(last < 1 << 18);
        let chunks = state.chunks_in_piece(num - 1);
        let final_chunk = state.chunk_request(num - 1, chunks - 1);
        assert_eq!(final_chunk.length, 12935);
    }

    #[test]
    fn metadata_size_validation() {
        let torrent = Torrent::new(TorrentParams {
            info_hash: [0; 20],
            local_peer_id: PeerId::generate(),
            config: Config::default(),
            callbacks: Callbacks::default(),
            storage: Arc::new(crate::storage::MemoryStorage::new(0, 0)),
            info: None,
            chunk_size: None,
            limits: BandwidthLimiter::unlimited(),
        });
        let mut state = torrent.lock();
        assert!(state.set_metadata_size(MAX_METADATA_SIZE + 1).is_err());
        state.set_metadata_size(40_000).unwrap();
        assert!(state.set_metadata_size(40_000).is_ok());
        assert!(state.set_metadata_size(50_000).is_err());
        assert_eq!(state.metadata_piece_count(), 3);
        assert_eq!(state.metadata_bytes().len(), 40_000);
        assert!(!state.have_all_metadata_pieces());
    }
}
