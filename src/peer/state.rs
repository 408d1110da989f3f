//! Per-connection peer state.
//!
//! A [`Peer`] record holds everything the torrent lock protects for one
//! connection: what the remote claims to have, choke/interest in both
//! directions, the request ledger sets, extension state, timers, and
//! counters. The record lives in the torrent's peer table; the
//! [`PeerConn`](super::conn::PeerConn) handle looks it up by key.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use super::bitfield::Bitfield;
use super::message::Message;
use super::order::RequestOrder;
use super::peer_id::PeerId;
use super::requests::BlockRequest;
use crate::config::DEFAULT_PEER_MAX_REQUESTS;
use crate::pex::{PexConnState, PexFlags};

/// Arena key of a peer within its torrent.
pub type PeerKey = u64;

/// Where a peer candidate was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Incoming,
    DhtGetPeers,
    DhtAnnouncePeer,
    Pex,
    /// Given directly, such as through a magnet link.
    Direct,
}

impl PeerSource {
    /// Short tag used in connection status strings.
    pub fn tag(self) -> &'static str {
        match self {
            PeerSource::Tracker => "Tr",
            PeerSource::Incoming => "I",
            PeerSource::DhtGetPeers => "Hg",
            PeerSource::DhtAnnouncePeer => "Ha",
            PeerSource::Pex => "X",
            PeerSource::Direct => "M",
        }
    }
}

/// Transport the connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Utp,
    Ws,
}

impl Network {
    pub fn is_utp(self) -> bool {
        matches!(self, Network::Utp)
    }
}

/// MSE obfuscation applied by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoMethod {
    #[default]
    Plaintext,
    Rc4,
}

/// Encryption facts reported by the transport handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoState {
    pub method: CryptoMethod,
    pub header_encrypted: bool,
}

/// Byte and chunk counters for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub bytes_written: u64,
    pub bytes_written_data: u64,
    pub bytes_read: u64,
    pub bytes_read_data: u64,
    pub bytes_read_useful_data: u64,
    pub chunks_written: u64,
    pub chunks_read: u64,
    pub chunks_read_useful: u64,
    pub chunks_read_wasted: u64,
    pub pieces_dirtied_good: u64,
    pub pieces_dirtied_bad: u64,
}

/// Ranks peers for retention under churn: explicitly trusted peers
/// first, then by net good pieces contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionTrust {
    pub trusted: bool,
    pub net_good_pieces_dirtied: i64,
}

/// Write-buffer length past which [`Peer::write_message`] reports
/// back-pressure to the producer.
pub(crate) const WRITE_BUFFER_HIGH_WATER: usize = 1 << 16;

pub struct Peer {
    pub(crate) key: PeerKey,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) network: Network,
    pub(crate) outgoing: bool,
    pub(crate) discovery: PeerSource,
    pub(crate) trusted: bool,
    pub(crate) crypto: CryptoState,
    pub(crate) peer_id: PeerId,
    /// Fast extension negotiated on both sides.
    pub(crate) fast_enabled: bool,
    /// Extension protocol negotiated on both sides.
    pub(crate) extended_enabled: bool,

    pub(crate) completed_handshake: Instant,
    pub(crate) last_message_received: Option<Instant>,
    pub(crate) last_useful_chunk_received: Option<Instant>,
    pub(crate) last_chunk_sent: Option<Instant>,
    pub(crate) last_became_interested: Option<Instant>,
    pub(crate) last_started_expecting: Option<Instant>,
    pub(crate) prior_interest: Duration,
    pub(crate) cumulative_expected_to_receive: Duration,
    pub(crate) chunks_received_while_expecting: u64,

    // Controlled by us.
    pub(crate) am_interested: bool,
    pub(crate) am_choking: bool,
    pub(crate) actual_requests: HashSet<BlockRequest>,
    pub(crate) next_requests: HashSet<BlockRequest>,
    pub(crate) next_interested: bool,
    /// Chunks we might still reasonably receive. Latency and buffering
    /// mean chunks can arrive for requests we no longer hold.
    pub(crate) valid_receive_chunks: HashMap<BlockRequest, u32>,
    /// Indexed by metadata piece, true while posted and unanswered.
    pub(crate) metadata_requests: Vec<bool>,
    pub(crate) sent_haves: HashSet<u32>,

    // Controlled by the remote peer.
    pub(crate) peer_interested: bool,
    pub(crate) peer_choking: bool,
    pub(crate) peer_requests: HashMap<BlockRequest, Option<Bytes>>,
    pub(crate) peer_listen_port: u16,
    pub(crate) peer_prefers_encryption: bool,
    pub(crate) peer_client_name: Option<String>,
    pub(crate) peer_extension_ids: HashMap<String, u8>,
    pub(crate) peer_max_requests: usize,
    pub(crate) peer_pieces: Bitfield,
    pub(crate) peer_sent_have_all: bool,
    /// Highest possible piece count implied by the peer's messages;
    /// only interesting until the torrent info is known.
    pub(crate) peer_min_pieces: u32,
    pub(crate) peer_touched_pieces: HashSet<u32>,
    pub(crate) peer_allowed_fast: HashSet<u32>,

    pub(crate) request_order: RequestOrder,
    pub(crate) inclination: Option<Vec<u32>>,
    pub(crate) pieces_received_since_last_request_update: usize,
    pub(crate) max_pieces_received_between_request_updates: usize,

    pub(crate) pex: PexConnState,
    pub(crate) stats: ConnStats,

    pub(crate) out_buf: BytesMut,
    pub(crate) write_notify: Arc<Notify>,
    pub(crate) closed_notify: Arc<Notify>,
    pub(crate) closed_flag: Arc<AtomicBool>,
    pub(crate) closed: bool,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: PeerKey,
        remote_addr: SocketAddr,
        network: Network,
        outgoing: bool,
        discovery: PeerSource,
        trusted: bool,
        crypto: CryptoState,
        peer_id: PeerId,
        fast_enabled: bool,
        extended_enabled: bool,
    ) -> Self {
        Self {
            key,
            remote_addr,
            network,
            outgoing,
            discovery,
            trusted,
            crypto,
            peer_id,
            fast_enabled,
            extended_enabled,
            completed_handshake: Instant::now(),
            last_message_received: None,
            last_useful_chunk_received: None,
            last_chunk_sent: None,
            last_became_interested: None,
            last_started_expecting: None,
            prior_interest: Duration::ZERO,
            cumulative_expected_to_receive: Duration::ZERO,
            chunks_received_while_expecting: 0,
            am_interested: false,
            am_choking: true,
            actual_requests: HashSet::new(),
            next_requests: HashSet::new(),
            next_interested: false,
            valid_receive_chunks: HashMap::new(),
            metadata_requests: Vec::new(),
            sent_haves: HashSet::new(),
            peer_interested: false,
            peer_choking: true,
            peer_requests: HashMap::new(),
            peer_listen_port: 0,
            peer_prefers_encryption: false,
            peer_client_name: None,
            peer_extension_ids: HashMap::new(),
            peer_max_requests: DEFAULT_PEER_MAX_REQUESTS,
            peer_pieces: Bitfield::new(0),
            peer_sent_have_all: false,
            peer_min_pieces: 0,
            peer_touched_pieces: HashSet::new(),
            peer_allowed_fast: HashSet::new(),
            request_order: RequestOrder::new(),
            inclination: None,
            pieces_received_since_last_request_update: 0,
            max_pieces_received_between_request_updates: 0,
            pex: PexConnState::default(),
            stats: ConnStats::default(),
            out_buf: BytesMut::new(),
            write_notify: Arc::new(Notify::new()),
            closed_notify: Arc::new(Notify::new()),
            closed_flag: Arc::new(AtomicBool::new(false)),
            closed: false,
        }
    }

    pub(crate) fn supports_extension(&self, name: &str) -> bool {
        self.peer_extension_ids.contains_key(name)
    }

    pub(crate) fn peer_has_piece(&self, piece: u32) -> bool {
        self.peer_sent_have_all || self.peer_pieces.has_piece(piece as usize)
    }

    /// Whether the remote would reject a request for this piece:
    /// choking us and the piece isn't in our allowed-fast set.
    pub(crate) fn remote_choking_piece(&self, piece: u32) -> bool {
        self.peer_choking && !self.peer_allowed_fast.contains(&piece)
    }

    /// Best guess at the torrent's piece count for this peer.
    pub(crate) fn best_peer_num_pieces(&self, num_pieces: Option<u32>) -> u32 {
        num_pieces.unwrap_or(self.peer_min_pieces)
    }

    /// `(all, known)`: whether the peer has every piece, and whether we
    /// can even tell yet.
    pub(crate) fn peer_has_all_pieces(&self, num_pieces: Option<u32>) -> (bool, bool) {
        if self.peer_sent_have_all {
            return (true, true);
        }
        match num_pieces {
            None => (false, false),
            Some(n) => (
                (0..n).all(|i| self.peer_pieces.has_piece(i as usize)),
                true,
            ),
        }
    }

    pub(crate) fn raise_peer_min_pieces(&mut self, new_min: u32) {
        if new_min > self.peer_min_pieces {
            self.peer_min_pieces = new_min;
        }
    }

    /// True while we expect chunks to be flowing: interested, with
    /// outstanding requests, at least one of which isn't piece-choked.
    pub(crate) fn expecting_chunks(&self) -> bool {
        if !self.am_interested || self.actual_requests.is_empty() {
            return false;
        }
        self.actual_requests
            .iter()
            .any(|r| !self.remote_choking_piece(r.index))
    }

    pub(crate) fn update_expecting_chunks(&mut self) {
        if self.expecting_chunks() {
            if self.last_started_expecting.is_none() {
                self.last_started_expecting = Some(Instant::now());
            }
        } else if let Some(started) = self.last_started_expecting.take() {
            self.cumulative_expected_to_receive += started.elapsed();
        }
    }

    pub(crate) fn total_expecting_time(&self) -> Duration {
        self.cumulative_expected_to_receive
            + self
                .last_started_expecting
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO)
    }

    /// Total time we've been interested in this peer.
    pub(crate) fn cum_interest(&self) -> Duration {
        let mut total = self.prior_interest;
        if self.am_interested {
            if let Some(since) = self.last_became_interested {
                total += since.elapsed();
            }
        }
        total
    }

    /// Flips our interest flag, maintaining the interest accumulators.
    /// Returns false if the flag already had that value.
    pub(crate) fn set_interested_flag(&mut self, interested: bool) -> bool {
        if self.am_interested == interested {
            return false;
        }
        self.am_interested = interested;
        if interested {
            self.last_became_interested = Some(Instant::now());
        } else if let Some(since) = self.last_became_interested {
            self.prior_interest += since.elapsed();
        }
        self.update_expecting_chunks();
        true
    }

    pub(crate) fn download_rate(&self) -> f64 {
        let bytes = self.stats.bytes_read_useful_data;
        if bytes == 0 {
            return 0.0;
        }
        bytes as f64 / self.total_expecting_time().as_secs_f64().max(f64::MIN_POSITIVE)
    }

    /// Appends an encoded message to the out-buffer and wakes the
    /// writer. Returns whether the producer may keep writing.
    pub(crate) fn write_message(&mut self, msg: &Message) -> bool {
        let before = self.out_buf.len();
        msg.encode_into(&mut self.out_buf);
        self.stats.bytes_written += (self.out_buf.len() - before) as u64;
        if let Message::Piece { data, .. } = msg {
            self.stats.bytes_written_data += data.len() as u64;
            self.stats.chunks_written += 1;
        }
        self.write_notify.notify_one();
        self.out_buf.len() < WRITE_BUFFER_HIGH_WATER
    }

    /// Sends a Have unless one for this piece already went out.
    pub(crate) fn have(&mut self, piece: u32) {
        if self.sent_haves.insert(piece) {
            self.write_message(&Message::Have { piece });
        }
    }

    pub(crate) fn requested_metadata_piece(&self, index: usize) -> bool {
        self.metadata_requests.get(index).copied().unwrap_or(false)
    }

    pub(crate) fn mark_metadata_requested(&mut self, index: usize) {
        if self.metadata_requests.len() <= index {
            self.metadata_requests.resize(index + 1, false);
        }
        self.metadata_requests[index] = true;
    }

    pub(crate) fn peer_has_wanted_pieces(&self) -> bool {
        !self.request_order.is_empty()
    }

    pub(crate) fn net_good_pieces_dirtied(&self) -> i64 {
        self.stats.pieces_dirtied_good as i64 - self.stats.pieces_dirtied_bad as i64
    }

    pub(crate) fn connection_trust(&self) -> ConnectionTrust {
        ConnectionTrust {
            trusted: self.trusted,
            net_good_pieces_dirtied: self.net_good_pieces_dirtied(),
        }
    }

    /// Last moment this peer was helpful: gave us a useful chunk, or
    /// took one while we seed.
    pub(crate) fn last_helpful(&self, seeding: bool) -> Option<Instant> {
        match (self.last_useful_chunk_received, self.last_chunk_sent) {
            (received, Some(sent)) if seeding => Some(received.map_or(sent, |r| r.max(sent))),
            (received, _) => received,
        }
    }

    /// The dialer should be the endpoint with the numerically smaller
    /// peer ID.
    pub(crate) fn is_preferred_direction(&self, local_id: &PeerId) -> bool {
        (local_id.as_bytes() < self.peer_id.as_bytes()) == self.outgoing
    }

    /// Prefers this connection over `other` on networking properties
    /// alone: preferred direction, then not-uTP, then IPv6. `None` when
    /// the properties don't distinguish them.
    pub(crate) fn has_preferred_network_over(&self, other: &Peer, local_id: &PeerId) -> Option<bool> {
        let pairs = [
            (
                self.is_preferred_direction(local_id),
                other.is_preferred_direction(local_id),
            ),
            (!self.network.is_utp(), !other.network.is_utp()),
            (self.remote_addr.is_ipv6(), other.remote_addr.is_ipv6()),
        ];
        for (left, right) in pairs {
            if left != right {
                return Some(left);
            }
        }
        None
    }

    /// Single-letter connection flags for status display.
    pub(crate) fn connection_flags(&self) -> String {
        let mut flags = String::new();
        if self.crypto.method == CryptoMethod::Rc4 {
            flags.push('E');
        } else if self.crypto.header_encrypted {
            flags.push('e');
        }
        flags.push_str(self.discovery.tag());
        if self.network.is_utp() {
            flags.push('U');
        }
        flags
    }

    /// "have/total" progress string based on the peer's claims.
    pub(crate) fn completed_string(&self, num_pieces: Option<u32>) -> String {
        let total = self.best_peer_num_pieces(num_pieces);
        let have = if self.peer_sent_have_all {
            total
        } else {
            self.peer_pieces.count() as u32
        };
        format!("{}/{}", have, total)
    }

    /// The address to redial this peer, taking its advertised listen
    /// port into account.
    pub(crate) fn dial_addr(&self) -> SocketAddr {
        let mut addr = self.remote_addr;
        if !self.outgoing && self.peer_listen_port != 0 {
            addr.set_port(self.peer_listen_port);
        }
        addr
    }

    pub(crate) fn pex_flags(&self) -> PexFlags {
        PexFlags {
            prefers_encryption: self.peer_prefers_encryption,
            outgoing: self.outgoing,
            utp: self.network.is_utp(),
            ..Default::default()
        }
    }

    /// All pieces the peer could have based on its claims so far.
    pub(crate) fn claimed_pieces(&self, num_pieces: Option<u32>) -> Bitfield {
        if self.peer_sent_have_all {
            let n = self.best_peer_num_pieces(num_pieces) as usize;
            let mut all = Bitfield::new(n);
            for i in 0..n {
                all.set_piece(i);
            }
            all
        } else {
            let mut claimed = self.peer_pieces.clone();
            if let Some(n) = num_pieces {
                claimed.truncate(n as usize);
            }
            claimed
        }
    }
}

/// A point-in-time view of a connection for display.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub remote_addr: SocketAddr,
    pub peer_id: PeerId,
    pub client_name: Option<String>,
    pub flags: String,
    pub completed: String,
    pub stats: ConnStats,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub outstanding_requests: usize,
    pub queued_uploads: usize,
    pub download_rate: f64,
    /// Total time we've been interested in this peer.
    pub cum_interest: Duration,
}
