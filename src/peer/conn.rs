//! The connection driver: inbound dispatcher, outbound writer, upload
//! server, and teardown.
//!
//! Each connection runs two tasks over a transport-provided byte
//! stream. The reader decodes one message at a time with the torrent
//! lock released, then dispatches under the lock. The writer parks on a
//! notify acting as the write condition; any state change that could
//! produce output tickles it, and it drains the peer's out-buffer
//! through the socket. Storage reads for uploads run on blocking worker
//! threads; the storage write for a received chunk happens inline on
//! the reader task with the lock released.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::bitfield::Bitfield;
use super::extension::{
    ExtensionHandshake, EXTENSION_HANDSHAKE_ID, EXTENSION_NAME_METADATA, EXTENSION_NAME_PEX,
};
use super::fast::generate_allowed_fast_set;
use super::message::{FrameDecoder, Handshake, Message};
use super::metadata::{MetadataMessage, MetadataMessageType};
use super::requests::{BlockRequest, RequestRefusal};
use super::state::{
    ConnStats, ConnectionTrust, CryptoState, Network, Peer, PeerKey, PeerSnapshot, PeerSource,
};
use super::PeerError;
use crate::config::{ALLOWED_FAST_SET_SIZE, MAX_FRAME_LEN};
use crate::peer::PeerId;
use crate::pex::PexMessage;
use crate::torrent::{Torrent, TorrentState};

/// Facts about a freshly handshaken connection, as supplied by the
/// transport layer.
pub struct PeerOptions {
    pub remote_addr: SocketAddr,
    pub network: Network,
    pub outgoing: bool,
    pub discovery: PeerSource,
    pub trusted: bool,
    pub crypto: CryptoState,
    /// The handshake the remote sent.
    pub handshake: Handshake,
}

/// Handle to one peer connection, shared by its reader and writer
/// tasks. The mutable state lives in the torrent's peer table; this
/// carries only the key and the wakeup primitives.
pub struct PeerConn {
    torrent: Arc<Torrent>,
    key: PeerKey,
    closed_flag: Arc<AtomicBool>,
    write_notify: Arc<Notify>,
    closed_notify: Arc<Notify>,
}

impl Torrent {
    /// Attaches a handshaken connection to this torrent. This is the
    /// only way a peer joins; it happens exactly once per connection.
    pub fn add_peer(self: &Arc<Self>, opts: PeerOptions) -> Arc<PeerConn> {
        let mut state = self.lock();
        let key = state.alloc_peer_key();
        let fast = opts.handshake.supports_fast_extension() && self.config.extensions.supports_fast;
        let extended =
            opts.handshake.supports_extension_protocol() && self.config.extensions.supports_extended;
        let peer = Peer::new(
            key,
            opts.remote_addr,
            opts.network,
            opts.outgoing,
            opts.discovery,
            opts.trusted,
            opts.crypto,
            PeerId(opts.handshake.peer_id),
            fast,
            extended,
        );
        let conn = Arc::new(PeerConn {
            torrent: self.clone(),
            key,
            closed_flag: peer.closed_flag.clone(),
            write_notify: peer.write_notify.clone(),
            closed_notify: peer.closed_notify.clone(),
        });
        state.peers.insert(key, peer);
        conn
    }
}

impl PeerConn {
    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::SeqCst)
    }

    /// Closes the connection: availability decremented exactly once,
    /// the ledger drained, both tasks woken, callbacks fired.
    pub fn close(&self) {
        self.torrent.lock().close_peer(self.key);
    }

    /// Spawns the reader and writer tasks over the byte stream. The
    /// returned handle resolves with the reader's verdict after the
    /// connection has been torn down.
    pub fn start<S>(self: &Arc<Self>, stream: S) -> tokio::task::JoinHandle<Result<(), PeerError>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = tokio::spawn(self.clone().writer_loop(write_half));
        let conn = self.clone();
        tokio::spawn(async move {
            let result = conn.clone().reader_loop(read_half).await;
            if let Err(err) = &result {
                debug!("peer connection failed: {}", err);
            }
            conn.close();
            let _ = writer.await;
            result
        })
    }

    /// Sends the post-handshake message burst: extended handshake,
    /// have state (HaveAll/HaveNone/Bitfield), allowed-fast grants.
    /// The bitfield must precede any Have, so this runs before the
    /// reader starts.
    pub fn on_connected(&self) {
        let mut guard = self.torrent.lock();
        let state = &mut *guard;

        let seeding = state.seeding();
        let have_info = state.have_info();
        let num_pieces = state.num_pieces();
        let completed = state.completed_snapshot();
        let metadata_len = state.info_bytes().map(|b| b.len());
        let hs_payload = ExtensionHandshake::ours(&state.config, metadata_len).encode();
        let info_hash = self.torrent.info_hash();

        let Some(peer) = state.peers.get_mut(&self.key) else {
            return;
        };
        if peer.extended_enabled {
            peer.write_message(&Message::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload: hs_payload,
            });
        }
        if peer.fast_enabled {
            if seeding {
                peer.write_message(&Message::HaveAll);
                if let Some(num) = num_pieces {
                    peer.sent_haves.extend(0..num);
                }
            } else if !have_info || completed.is_empty() {
                peer.write_message(&Message::HaveNone);
            } else {
                peer.sent_haves.extend(completed.iter_set().map(|i| i as u32));
                peer.write_message(&Message::Bitfield(completed.to_bytes()));
            }
        } else if have_info && !completed.is_empty() {
            peer.sent_haves.extend(completed.iter_set().map(|i| i as u32));
            peer.write_message(&Message::Bitfield(completed.to_bytes()));
        }
        if peer.fast_enabled {
            if let Some(num) = num_pieces {
                let grants = generate_allowed_fast_set(
                    &info_hash,
                    peer.remote_addr.ip(),
                    num,
                    ALLOWED_FAST_SET_SIZE,
                );
                for piece in grants {
                    peer.write_message(&Message::AllowedFast { piece });
                }
            }
        }
    }

    // ---- upward contract ----

    /// Issues a request directly. The preconditions (peer has the
    /// piece, piece not hashing or queued, connection open) are the
    /// caller's responsibility; violating them is a bug and panics.
    pub fn request(&self, r: BlockRequest) -> Result<(), RequestRefusal> {
        let mut guard = self.torrent.lock();
        let state = &mut *guard;
        if state.hashing(r.index) {
            panic!("requesting piece {} while it is being hashed", r.index);
        }
        if state.queued_for_hash(r.index) {
            panic!("requesting piece {} while it is queued for hash", r.index);
        }
        let callbacks = state.callbacks.clone();
        let Some(peer) = state.peers.get_mut(&self.key) else {
            panic!("requesting on a closed connection");
        };
        assert!(!peer.closed, "requesting on a closed connection");
        assert!(
            peer.peer_has_piece(r.index),
            "requesting piece {} the peer doesn't have",
            r.index
        );
        peer.request_block(r, &mut state.pending, &callbacks)
            .map(|_| ())
    }

    /// Cancels an outstanding request; safe to repeat.
    pub fn cancel(&self, r: BlockRequest) {
        let mut guard = self.torrent.lock();
        let state = &mut *guard;
        let callbacks = state.callbacks.clone();
        if let Some(peer) = state.peers.get_mut(&self.key) {
            peer.cancel_block(r, &mut state.pending, &callbacks);
        }
    }

    pub fn choke(&self) {
        let mut guard = self.torrent.lock();
        choke_peer(&mut guard, self.key);
    }

    pub fn unchoke(&self) {
        let mut guard = self.torrent.lock();
        unchoke_peer(&mut guard, self.key);
    }

    /// Emits at most one wire message per actual transition.
    pub fn set_interested(&self, interested: bool) {
        let mut guard = self.torrent.lock();
        if let Some(peer) = guard.peers.get_mut(&self.key) {
            if peer.set_interested_flag(interested) {
                let msg = if interested {
                    Message::Interested
                } else {
                    Message::NotInterested
                };
                peer.write_message(&msg);
            }
        }
    }

    pub fn peer_has_piece(&self, piece: u32) -> bool {
        self.torrent
            .lock()
            .peers
            .get(&self.key)
            .is_some_and(|p| p.peer_has_piece(piece))
    }

    pub fn peer_has_wanted_pieces(&self) -> bool {
        self.torrent
            .lock()
            .peers
            .get(&self.key)
            .is_some_and(|p| p.peer_has_wanted_pieces())
    }

    /// Whether the connection can still do anything for us: provide
    /// metadata pre-info, take uploads while we seed, or serve pieces
    /// we want.
    pub fn useful(&self) -> bool {
        let state = self.torrent.lock();
        let Some(peer) = state.peers.get(&self.key) else {
            return false;
        };
        if peer.closed {
            return false;
        }
        if !state.have_info() {
            return peer.supports_extension(EXTENSION_NAME_METADATA);
        }
        if state.seeding() && peer.peer_interested {
            return true;
        }
        peer.peer_has_wanted_pieces()
    }

    pub fn stats(&self) -> ConnStats {
        self.torrent
            .lock()
            .peers
            .get(&self.key)
            .map(|p| p.stats)
            .unwrap_or_default()
    }

    pub fn trust(&self) -> ConnectionTrust {
        self.torrent
            .lock()
            .peers
            .get(&self.key)
            .map(|p| p.connection_trust())
            .unwrap_or(ConnectionTrust {
                trusted: false,
                net_good_pieces_dirtied: 0,
            })
    }

    /// Snapshot of the pieces the peer could have, for display.
    pub fn peer_pieces(&self) -> Bitfield {
        let state = self.torrent.lock();
        let num = state.num_pieces();
        state
            .peers
            .get(&self.key)
            .map(|p| p.claimed_pieces(num))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Option<PeerSnapshot> {
        let state = self.torrent.lock();
        let num = state.num_pieces();
        let peer = state.peers.get(&self.key)?;
        Some(PeerSnapshot {
            remote_addr: peer.remote_addr,
            peer_id: peer.peer_id,
            client_name: peer.peer_client_name.clone(),
            flags: peer.connection_flags(),
            completed: peer.completed_string(num),
            stats: peer.stats,
            am_choking: peer.am_choking,
            am_interested: peer.am_interested,
            peer_choking: peer.peer_choking,
            peer_interested: peer.peer_interested,
            outstanding_requests: peer.actual_requests.len(),
            queued_uploads: peer.peer_requests.len(),
            download_rate: peer.download_rate(),
            cum_interest: peer.cum_interest(),
        })
    }

    /// Last moment this peer was helpful: gave us a useful chunk, or
    /// took one while we seed.
    pub fn last_helpful(&self) -> Option<Instant> {
        let state = self.torrent.lock();
        let seeding = state.seeding();
        state
            .peers
            .get(&self.key)
            .and_then(|p| p.last_helpful(seeding))
    }

    /// Breaks ties between two connections to the same peer on their
    /// networking properties.
    pub fn has_preferred_network_over(&self, other: &PeerConn) -> Option<bool> {
        let state = self.torrent.lock();
        let left = state.peers.get(&self.key)?;
        let right = state.peers.get(&other.key)?;
        left.has_preferred_network_over(right, &state.local_peer_id)
    }

    // ---- inbound dispatch ----

    /// Applies one decoded message to peer and torrent state. Errors
    /// are fatal to the connection.
    pub fn handle_message(&self, msg: Message) -> Result<(), PeerError> {
        let msg = match msg {
            Message::Piece { index, begin, data } => {
                let result = self.receive_chunk(index, begin, &data);
                self.torrent.chunk_pool.put(data);
                self.torrent.broadcast_event();
                return result;
            }
            other => other,
        };

        let mut guard = self.torrent.lock();
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }
        if let Some(f) = &state.callbacks.read_message {
            f(self.key, &msg);
        }
        let Some(peer) = state.peers.get_mut(&self.key) else {
            return Ok(());
        };
        if peer.closed {
            return Ok(());
        }
        peer.last_message_received = Some(Instant::now());
        if let Some(id) = msg.id() {
            if id.is_fast_extension() && !peer.fast_enabled {
                debug!("fast extension message while extension is disabled");
                return Err(PeerError::FastDisabled(id as u8));
            }
        }

        match msg {
            Message::KeepAlive => Ok(()),
            Message::Choke => {
                let callbacks = state.callbacks.clone();
                let peer = state.peers.get_mut(&self.key).expect("peer vanished");
                peer.peer_choking = true;
                if !peer.fast_enabled {
                    peer.delete_all_requests(&mut state.pending, &callbacks);
                }
                peer.update_expecting_chunks();
                state.update_peer_requests(self.key);
                Ok(())
            }
            Message::Unchoke => {
                peer.peer_choking = false;
                peer.update_expecting_chunks();
                peer.write_notify.notify_one();
                Ok(())
            }
            Message::Interested => {
                peer.peer_interested = true;
                peer.write_notify.notify_one();
                Ok(())
            }
            Message::NotInterested => {
                // Their queued requests stay; the spec doesn't say to
                // drop them here, and a later choke clears or rejects.
                peer.peer_interested = false;
                Ok(())
            }
            Message::Have { piece } => self.on_have(state, piece),
            Message::Bitfield(bits) => self.on_bitfield(state, &bits),
            Message::Request {
                index,
                begin,
                length,
            } => self.on_read_request(state, BlockRequest::new(index, begin, length)),
            Message::Piece { .. } => unreachable!("handled above"),
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                self.on_peer_sent_cancel(state, BlockRequest::new(index, begin, length));
                Ok(())
            }
            Message::Port(port) => {
                let mut addr = state
                    .peers
                    .get(&self.key)
                    .map(|p| p.remote_addr)
                    .expect("peer vanished");
                if port != 0 {
                    addr.set_port(port);
                }
                for server in state.dht_servers() {
                    server.ping(addr);
                }
                Ok(())
            }
            Message::Suggest { piece } => {
                debug!("peer suggested piece {}", piece);
                state.update_peer_requests(self.key);
                Ok(())
            }
            Message::HaveAll => {
                self.on_have_all(state);
                Ok(())
            }
            Message::HaveNone => {
                self.on_have_none(state);
                Ok(())
            }
            Message::Reject {
                index,
                begin,
                length,
            } => {
                let callbacks = state.callbacks.clone();
                let peer = state.peers.get_mut(&self.key).expect("peer vanished");
                peer.remote_rejected_request(
                    BlockRequest::new(index, begin, length),
                    &mut state.pending,
                    &callbacks,
                );
                Ok(())
            }
            Message::AllowedFast { piece } => {
                debug!("peer allowed fast: {}", piece);
                peer.peer_allowed_fast.insert(piece);
                peer.update_expecting_chunks();
                state.update_peer_requests(self.key);
                Ok(())
            }
            Message::Extended { id, payload } => {
                let result = self.on_extended(state, id, &payload);
                drop(guard);
                self.torrent.broadcast_event();
                result
            }
        }
    }

    fn on_have(&self, state: &mut TorrentState, piece: u32) -> Result<(), PeerError> {
        if let Some(num) = state.num_pieces() {
            if piece >= num {
                return Err(PeerError::InvalidPieceIndex(piece));
            }
        }
        let have_info = state.have_info();
        let peer = state.peers.get_mut(&self.key).expect("peer vanished");
        peer.raise_peer_min_pieces(piece + 1);
        let newly_claimed = !peer.peer_has_piece(piece);
        if newly_claimed {
            peer.peer_pieces.set_piece(piece as usize);
            if have_info {
                state.inc_piece_availability(piece);
            }
        }
        state.maybe_drop_mutually_complete_peer(self.key);
        if state.update_piece_priority(self.key, piece) {
            state.update_peer_requests(self.key);
        }
        Ok(())
    }

    fn on_bitfield(&self, state: &mut TorrentState, bits: &Bytes) -> Result<(), PeerError> {
        let num = state.num_pieces();
        let bit_len = bits.len() * 8;
        // Known excess pieces are ignored; the last byte can waste at
        // most 7 bits.
        let logical = match num {
            Some(n) => (n as usize).min(bit_len),
            None => bit_len,
        };
        let new_claims = Bitfield::from_bytes(bits, logical);

        let peer = state.peers.get_mut(&self.key).expect("peer vanished");
        peer.raise_peer_min_pieces(bit_len.saturating_sub(7) as u32);
        let old_claims = peer.claimed_pieces(num);
        peer.peer_sent_have_all = false;
        peer.peer_pieces = new_claims.clone();

        if let Some(n) = num {
            for piece in 0..n as usize {
                match (old_claims.has_piece(piece), new_claims.has_piece(piece)) {
                    (false, true) => state.inc_piece_availability(piece as u32),
                    (true, false) => state.dec_piece_availability(piece as u32),
                    _ => {}
                }
            }
        }
        state.peer_pieces_changed(self.key);
        Ok(())
    }

    fn on_have_all(&self, state: &mut TorrentState) {
        let num = state.num_pieces();
        let peer = state.peers.get_mut(&self.key).expect("peer vanished");
        let old_claims = peer.claimed_pieces(num);
        peer.peer_sent_have_all = true;
        peer.peer_pieces.clear_all();
        if let Some(n) = num {
            for piece in 0..n {
                if !old_claims.has_piece(piece as usize) {
                    state.inc_piece_availability(piece);
                }
            }
        }
        state.peer_pieces_changed(self.key);
    }

    fn on_have_none(&self, state: &mut TorrentState) {
        let num = state.num_pieces();
        let peer = state.peers.get_mut(&self.key).expect("peer vanished");
        let old_claims = peer.claimed_pieces(num);
        peer.peer_sent_have_all = false;
        peer.peer_pieces.clear_all();
        if num.is_some() {
            for piece in old_claims.iter_set() {
                state.dec_piece_availability(piece as u32);
            }
        }
        state.peer_pieces_changed(self.key);
    }

    fn on_peer_sent_cancel(&self, state: &mut TorrentState, r: BlockRequest) {
        let peer = state.peers.get_mut(&self.key).expect("peer vanished");
        if !peer.peer_requests.contains_key(&r) {
            debug!("unexpected cancel received for {:?}", r);
            return;
        }
        if peer.fast_enabled {
            reject(peer, r);
        } else {
            peer.peer_requests.remove(&r);
        }
    }

    // ---- upload server ----

    /// Accepts an inbound Request per the fast-extension rules. Queue
    /// overflow and requests-while-choked are tolerated peer behavior;
    /// missing pieces and bad bounds fail the connection.
    fn on_read_request(&self, state: &mut TorrentState, r: BlockRequest) -> Result<(), PeerError> {
        let local_reqq = state.config.local_reqq;
        let have_piece = state.have_info() && state.have_piece(r.index);
        let piece_length = if have_piece {
            state.piece_length(r.index)
        } else {
            0
        };
        let abs_offset = if have_piece {
            state.request_abs_offset(r)
        } else {
            0
        };
        let peer = state.peers.get_mut(&self.key).expect("peer vanished");
        if peer.peer_requests.contains_key(&r) {
            debug!("duplicate request received: {:?}", r);
            return Ok(());
        }
        if peer.am_choking {
            if peer.fast_enabled {
                peer.write_message(&r.to_reject_message());
            }
            return Ok(());
        }
        if peer.peer_requests.len() >= local_reqq {
            // BEP 6 says we may close here if we choose; we drop or
            // reject instead.
            if peer.fast_enabled {
                peer.write_message(&r.to_reject_message());
            }
            return Ok(());
        }
        if !have_piece {
            // Not necessarily them misbehaving: pieces can drop out of
            // our storage and there's no way to tell peers short of
            // reconnecting.
            return Err(PeerError::RequestedMissingPiece(r.index));
        }
        if r.begin as u64 + r.length as u64 > piece_length {
            return Err(PeerError::BadRequestBounds {
                index: r.index,
                begin: r.begin,
                length: r.length,
            });
        }
        peer.peer_requests.insert(r, None);
        self.spawn_request_data_reader(r, abs_offset);
        Ok(())
    }

    /// Reads the requested chunk off storage on a blocking thread, then
    /// parks the buffer in the request entry and wakes the writer.
    fn spawn_request_data_reader(&self, r: BlockRequest, abs_offset: u64) {
        let torrent = self.torrent.clone();
        let key = self.key;
        tokio::task::spawn_blocking(move || {
            let result = torrent.storage.read(abs_offset, r.length);
            let mut guard = torrent.lock();
            let state = &mut *guard;
            match result {
                Ok(data) => {
                    if let Some(peer) = state.peers.get_mut(&key) {
                        if let Some(slot) = peer.peer_requests.get_mut(&r) {
                            *slot = Some(data);
                            peer.write_notify.notify_one();
                        }
                    }
                }
                Err(err) => request_data_read_failed(state, key, r, &err, &torrent),
            }
        });
    }

    /// Serves ready upload entries through the rate limiter, unchoking
    /// on entry and choking the peer once uploading stops being
    /// allowed. Returns a delay to retry after if the limiter imposed
    /// one.
    fn upload(&self, state: &mut TorrentState) -> Option<Duration> {
        loop {
            let Some(peer) = state.peers.get(&self.key) else {
                return None;
            };
            if peer.closed {
                return None;
            }
            if !upload_allowed(state, peer) {
                break;
            }
            unchoke_peer(state, self.key);
            let peer = state.peers.get_mut(&self.key).expect("peer vanished");
            let Some((&r, _)) = peer.peer_requests.iter().find(|(_, data)| data.is_some()) else {
                return None;
            };
            let reservation = self.torrent.upload_limiter.reserve(r.length as usize);
            if !reservation.ok() {
                panic!("upload rate limiter burst size < {}", r.length);
            }
            let delay = reservation.delay();
            if delay > Duration::ZERO {
                reservation.cancel();
                return Some(delay);
            }
            let data = peer
                .peer_requests
                .remove(&r)
                .flatten()
                .expect("entry had ready data");
            peer.last_chunk_sent = Some(Instant::now());
            peer.write_message(&Message::Piece {
                index: r.index,
                begin: r.begin,
                data,
            });
        }
        choke_peer(state, self.key);
        None
    }

    // ---- chunk receive ----

    /// Handles a received chunk per the receive protocol: ledger
    /// bookkeeping and cross-peer cancels under the lock, the storage
    /// write with the lock released, then write-side bookkeeping.
    ///
    /// The request is deleted from the ledger before the unlock so that
    /// receives or cancels racing from other peers can't double-count.
    fn receive_chunk(&self, index: u32, begin: u32, data: &Bytes) -> Result<(), PeerError> {
        let r = BlockRequest::new(index, begin, data.len() as u32);
        let mut guard = self.torrent.lock();
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }
        if let Some(f) = &state.callbacks.read_message {
            f(
                self.key,
                &Message::Piece {
                    index,
                    begin,
                    data: data.clone(),
                },
            );
        }
        let callbacks = state.callbacks.clone();
        let Some(peer) = state.peers.get_mut(&self.key) else {
            return Ok(());
        };
        if peer.closed {
            return Ok(());
        }
        peer.last_message_received = Some(Instant::now());
        peer.stats.chunks_read += 1;
        peer.stats.bytes_read_data += data.len() as u64;

        if peer.valid_receive_chunks.get(&r).copied().unwrap_or(0) == 0 {
            return Err(PeerError::UnexpectedChunk(r));
        }
        peer.dec_expected_chunk_receive(r);

        if peer.actual_requests.contains(&r) {
            if let Some(f) = &callbacks.received_requested {
                f(self.key, r);
            }
        }
        let deleted = peer.delete_request(r, &mut state.pending, &callbacks);
        if deleted && !peer.peer_choking {
            peer.chunks_received_while_expecting += 1;
        }

        if state.have_chunk(r) {
            let peer = state.peers.get_mut(&self.key).expect("peer vanished");
            peer.stats.chunks_read_wasted += 1;
            return Ok(());
        }

        let peer = state.peers.get_mut(&self.key).expect("peer vanished");
        peer.stats.chunks_read_useful += 1;
        peer.stats.bytes_read_useful_data += data.len() as u64;
        peer.last_useful_chunk_received = Some(Instant::now());
        if deleted {
            peer.pieces_received_since_last_request_update += 1;
        }
        if let Some(f) = &callbacks.received_useful_data {
            f(self.key, r);
        }

        // Record the pending write and claim the chunk before anything
        // else can look at it.
        state.inc_pending_writes(index);
        state.set_chunk_dirty(r);

        // Cancel this chunk from every other peer; peers without it
        // no-op.
        let others: Vec<PeerKey> = state
            .peers
            .keys()
            .copied()
            .filter(|&k| k != self.key)
            .collect();
        for other in others {
            if let Some(other_peer) = state.peers.get_mut(&other) {
                other_peer.cancel_block(r, &mut state.pending, &callbacks);
            }
        }
        if deleted {
            state.update_peer_requests(self.key);
        }

        drop(guard);
        let write_result = self.torrent.storage.write(index, begin, data);
        let mut guard = self.torrent.lock();
        let state = &mut *guard;

        state.dec_pending_writes(index);
        match write_result {
            Err(err) => {
                warn!("writing received chunk {:?}: {}", r, err);
                // Put the chunk back up for download and tell the
                // torrent; the connection itself carries on.
                state.clear_chunk_dirty(r);
                if let Some(f) = &callbacks.write_error {
                    f(&err);
                }
                Ok(())
            }
            Ok(()) => {
                state.mark_dirtied_by(index, self.key);
                if state.piece_all_dirty(index) && state.pending_writes(index) == 0 {
                    state.queue_piece_check(index);
                }
                Ok(())
            }
        }
    }

    // ---- extended protocol ----

    fn on_extended(
        &self,
        state: &mut TorrentState,
        id: u8,
        payload: &Bytes,
    ) -> Result<(), PeerError> {
        let result = self.on_extended_inner(state, id, payload);
        if result.is_err() {
            // Some clients address outgoing messages with their own
            // extension ids; tolerate the two known offenders.
            if let Some(peer) = state.peers.get(&self.key) {
                if peer.peer_id.has_prefix(b"-SD0100-") || peer.peer_id.has_prefix(b"-XL0012-") {
                    debug!("ignoring extended message error from known-buggy client");
                    return Ok(());
                }
            }
        }
        result
    }

    fn on_extended_inner(
        &self,
        state: &mut TorrentState,
        id: u8,
        payload: &Bytes,
    ) -> Result<(), PeerError> {
        match id {
            EXTENSION_HANDSHAKE_ID => self.on_extended_handshake(state, payload),
            super::extension::LOCAL_METADATA_ID => self.on_metadata_message(state, payload),
            super::extension::LOCAL_PEX_ID => {
                let enabled = state
                    .peers
                    .get(&self.key)
                    .is_some_and(|p| p.pex.is_enabled());
                if !enabled {
                    return Ok(());
                }
                let msg = PexMessage::decode_payload(payload)?;
                let mut discovered = msg.added;
                discovered.extend(msg.added6);
                state.push_discovered(discovered);
                Ok(())
            }
            other => Err(PeerError::Extension(format!(
                "unexpected extended message id {}",
                other
            ))),
        }
    }

    fn on_extended_handshake(
        &self,
        state: &mut TorrentState,
        payload: &Bytes,
    ) -> Result<(), PeerError> {
        let hs = ExtensionHandshake::decode(payload).map_err(|err| {
            debug!("error parsing extended handshake: {}", err);
            err
        })?;
        if let Some(f) = &state.callbacks.read_extended_handshake {
            f(self.key, &hs);
        }
        let disable_pex = state.config.disable_pex;
        let peer = state.peers.get_mut(&self.key).expect("peer vanished");
        if let Some(reqq) = hs.reqq {
            if reqq > 0 {
                peer.peer_max_requests = reqq as usize;
            }
        }
        if hs.client.is_some() {
            peer.peer_client_name = hs.client.clone();
        }
        if let Some(port) = hs.port {
            peer.peer_listen_port = port;
        }
        peer.peer_prefers_encryption = hs.prefers_encryption;
        for (name, ext_id) in &hs.extensions {
            if *ext_id == 0 {
                peer.peer_extension_ids.remove(name);
            } else {
                peer.peer_extension_ids.insert(name.clone(), *ext_id);
            }
        }
        let supports_pex = peer.supports_extension(EXTENSION_NAME_PEX);

        if let Some(size) = hs.metadata_size {
            if size > 0 {
                state.set_metadata_size(size as usize)?;
            }
        }
        self.request_pending_metadata(state);
        if !disable_pex && supports_pex {
            let peer = state.peers.get_mut(&self.key).expect("peer vanished");
            peer.pex.enable();
            peer.write_notify.notify_one();
        }
        Ok(())
    }

    /// Posts requests for all missing metadata pieces in shuffled
    /// order, skipping pieces with an outstanding request.
    fn request_pending_metadata(&self, state: &mut TorrentState) {
        if state.have_info() || state.info_bytes().is_some() {
            return;
        }
        let count = state.metadata_piece_count();
        if count == 0 {
            return;
        }
        let have: Vec<bool> = (0..count).map(|i| state.have_metadata_piece(i)).collect();
        let peer = state.peers.get_mut(&self.key).expect("peer vanished");
        let Some(&ext_id) = peer.peer_extension_ids.get(EXTENSION_NAME_METADATA) else {
            return;
        };
        if ext_id == 0 {
            return;
        }
        let mut pending: Vec<u32> = (0..count as u32)
            .filter(|&i| !have[i as usize] && !peer.requested_metadata_piece(i as usize))
            .collect();
        use rand::seq::SliceRandom;
        pending.shuffle(&mut rand::rng());
        for piece in pending {
            debug!("requesting metadata piece {}", piece);
            peer.write_message(&Message::Extended {
                id: ext_id,
                payload: MetadataMessage::request(piece).encode(),
            });
            peer.mark_metadata_requested(piece as usize);
        }
    }

    fn on_metadata_message(
        &self,
        state: &mut TorrentState,
        payload: &Bytes,
    ) -> Result<(), PeerError> {
        let msg = MetadataMessage::decode(payload)?;
        match msg.msg_type {
            MetadataMessageType::Data => {
                let peer = state.peers.get_mut(&self.key).expect("peer vanished");
                if !peer.requested_metadata_piece(msg.piece as usize) {
                    return Err(PeerError::Extension(format!(
                        "unexpected metadata piece {}",
                        msg.piece
                    )));
                }
                peer.metadata_requests[msg.piece as usize] = false;
                let data = msg
                    .data
                    .ok_or_else(|| PeerError::Extension("metadata data without payload".into()))?;
                if let Some(total) = msg.total_size {
                    state.set_metadata_size(total as usize)?;
                }
                state.got_metadata_piece(msg.piece, &data)?;
                Ok(())
            }
            MetadataMessageType::Request => {
                let reply = match state.metadata_piece_data(msg.piece) {
                    Some(data) => {
                        let total = state.info_bytes().expect("serving verified metadata").len();
                        MetadataMessage::data(msg.piece, total as u32, data)
                    }
                    None => MetadataMessage::reject(msg.piece),
                };
                let peer = state.peers.get_mut(&self.key).expect("peer vanished");
                if let Some(&ext_id) = peer.peer_extension_ids.get(EXTENSION_NAME_METADATA) {
                    if ext_id != 0 {
                        peer.write_message(&Message::Extended {
                            id: ext_id,
                            payload: reply.encode(),
                        });
                    }
                }
                Ok(())
            }
            MetadataMessageType::Reject => {
                let peer = state.peers.get_mut(&self.key).expect("peer vanished");
                if (msg.piece as usize) < peer.metadata_requests.len() {
                    peer.metadata_requests[msg.piece as usize] = false;
                }
                Ok(())
            }
        }
    }

    // ---- writer ----

    /// Produces everything currently sendable, in order: converge the
    /// wire request state toward the scheduler's intent, then PEX
    /// shares, then upload responses.
    pub(crate) fn fill_write_buffer(&self, state: &mut TorrentState) -> Option<Duration> {
        self.apply_next_requests(state);
        self.share_pex(state);
        self.upload(state)
    }

    /// Converges `actual_requests` toward `next_requests`: interest
    /// transition first, then Requests for everything newly wanted that
    /// the remote isn't piece-choking, stopping at the nominal cap.
    fn apply_next_requests(&self, state: &mut TorrentState) {
        let callbacks = state.callbacks.clone();
        let Some(peer) = state.peers.get_mut(&self.key) else {
            return;
        };
        if peer.closed {
            return;
        }
        let interested = peer.next_interested;
        if peer.set_interested_flag(interested) {
            let msg = if interested {
                Message::Interested
            } else {
                Message::NotInterested
            };
            peer.write_message(&msg);
        }
        let mut wanted: Vec<BlockRequest> = peer
            .next_requests
            .iter()
            .filter(|r| !peer.actual_requests.contains(r))
            .copied()
            .collect();
        wanted.sort();

        for r in wanted {
            if state.hashing(r.index) || state.queued_for_hash(r.index) {
                continue;
            }
            let Some(peer) = state.peers.get_mut(&self.key) else {
                return;
            };
            if peer.closed {
                return;
            }
            if !peer.peer_has_piece(r.index) || peer.remote_choking_piece(r.index) {
                continue;
            }
            match peer.request_block(r, &mut state.pending, &callbacks) {
                Ok(_) => {}
                Err(RequestRefusal::AtCapacity) => break,
            }
        }
    }

    fn share_pex(&self, state: &mut TorrentState) {
        let live = state.live_pex_peers(self.key);
        let Some(peer) = state.peers.get_mut(&self.key) else {
            return;
        };
        if peer.closed || !peer.pex.is_enabled() {
            return;
        }
        let Some(&ext_id) = peer.peer_extension_ids.get(EXTENSION_NAME_PEX) else {
            return;
        };
        if ext_id == 0 {
            return;
        }
        if let Some(msg) = peer.pex.share(&live) {
            peer.write_message(&Message::Extended {
                id: ext_id,
                payload: msg.encode_payload(),
            });
        }
    }

    // ---- tasks ----

    async fn reader_loop<R>(self: Arc<Self>, reader: R) -> Result<(), PeerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = FrameDecoder::new(reader, self.torrent.chunk_pool.clone(), MAX_FRAME_LEN);
        let mut accounted = 0u64;
        loop {
            let msg = tokio::select! {
                result = decoder.read_message() => result,
                _ = self.closed_notify.notified() => return Ok(()),
            };
            if self.is_closed() {
                return Ok(());
            }
            let msg = msg?;

            {
                let mut state = self.torrent.lock();
                if let Some(peer) = state.peers.get_mut(&self.key) {
                    peer.stats.bytes_read += decoder.bytes_read() - accounted;
                }
                accounted = decoder.bytes_read();
            }

            if let Message::Piece { ref data, .. } = msg {
                let reservation = self.torrent.download_limiter.reserve(data.len());
                if reservation.ok() {
                    let delay = reservation.delay();
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            self.handle_message(msg)?;
        }
    }

    async fn writer_loop<W>(self: Arc<Self>, mut writer: W) -> Result<(), PeerError>
    where
        W: AsyncWrite + Unpin,
    {
        let keep_alive = self.torrent.config.keep_alive_interval;
        let mut last_write = tokio::time::Instant::now();
        loop {
            if self.is_closed() {
                return Ok(());
            }
            let (buf, retry) = {
                let mut guard = self.torrent.lock();
                let state = &mut *guard;
                if state.closed {
                    return Ok(());
                }
                let retry = self.fill_write_buffer(state);
                let Some(peer) = state.peers.get_mut(&self.key) else {
                    return Ok(());
                };
                (peer.out_buf.split(), retry)
            };
            if let Some(delay) = retry {
                let notify = self.write_notify.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    notify.notify_one();
                });
            }
            if buf.is_empty() {
                tokio::select! {
                    _ = self.write_notify.notified() => {}
                    _ = self.closed_notify.notified() => return Ok(()),
                    _ = tokio::time::sleep_until(last_write + keep_alive) => {
                        writer.write_all(&Message::KeepAlive.encode()).await?;
                        writer.flush().await?;
                        last_write = tokio::time::Instant::now();
                    }
                }
                continue;
            }
            writer.write_all(&buf).await?;
            writer.flush().await?;
            last_write = tokio::time::Instant::now();
        }
    }
}

/// Whether we may send this peer data right now.
pub(crate) fn upload_allowed(state: &TorrentState, peer: &Peer) -> bool {
    if state.config.no_upload || state.config.data_upload_disallowed {
        return false;
    }
    if state.seeding() {
        return true;
    }
    if !peer.peer_has_wanted_pieces() {
        return false;
    }
    // Don't upload more than the allowance past what we've downloaded.
    peer.stats.bytes_written_data
        < peer.stats.bytes_read_data + crate::config::UPLOAD_PAYLOAD_ALLOWANCE
}

/// Chokes the peer. Under the fast extension every queued request is
/// explicitly rejected; without it the queue is silently dropped.
pub(crate) fn choke_peer(state: &mut TorrentState, key: PeerKey) {
    let Some(peer) = state.peers.get_mut(&key) else {
        return;
    };
    if peer.am_choking {
        return;
    }
    peer.am_choking = true;
    peer.write_message(&Message::Choke);
    if peer.fast_enabled {
        let queued: Vec<BlockRequest> = peer.peer_requests.keys().copied().collect();
        for r in queued {
            reject(peer, r);
        }
    } else {
        peer.peer_requests.clear();
    }
}

pub(crate) fn unchoke_peer(state: &mut TorrentState, key: PeerKey) {
    let Some(peer) = state.peers.get_mut(&key) else {
        return;
    };
    if !peer.am_choking {
        return;
    }
    peer.am_choking = false;
    peer.write_message(&Message::Unchoke);
}

fn reject(peer: &mut Peer, r: BlockRequest) {
    assert!(peer.fast_enabled, "reject without fast extension");
    peer.write_message(&r.to_reject_message());
    peer.peer_requests.remove(&r);
}

/// An upload read failed: refresh the completion cache if storage
/// dropped the piece behind our back, then choke so the peer flushes
/// its requests.
fn request_data_read_failed(
    state: &mut TorrentState,
    key: PeerKey,
    r: BlockRequest,
    err: &crate::storage::StorageError,
    torrent: &Torrent,
) {
    warn!("error reading chunk for peer request {:?}: {}", r, err);
    if state.have_piece(r.index) && !torrent.storage.piece_complete(r.index) {
        state.clear_piece_complete(r.index);
    }
    let already_choking = state
        .peers
        .get(&key)
        .map(|p| p.am_choking)
        .unwrap_or(true);
    if already_choking {
        warn!("already choking peer, requests might not be rejected correctly");
    }
    choke_peer(state, key);
}
