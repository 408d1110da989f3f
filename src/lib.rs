//! peerwire - the peer connection core of a BitTorrent client
//!
//! This library maintains full-duplex protocol sessions with remote
//! peers: it tracks what each peer has and wants, schedules outbound
//! block requests, serves inbound requests, receives and accounts chunk
//! data, and reconciles connection-level state with the owning torrent.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding for extension payloads
//! - [`peer`] - BEP-3/6/9/10 wire codec, peer state, request ledger,
//!   connection tasks
//! - [`pex`] - BEP-11 peer exchange
//! - [`torrent`] - torrent-wide shared state the connections reconcile with
//! - [`storage`] - the piece storage collaborator interface
//! - [`bandwidth`] - upload/download token-bucket rate limiting
//! - [`pool`] - pooled chunk buffers for Piece payloads
//! - [`config`] - session tunables
//!
//! Peer discovery, transport dialing and encryption handshakes, piece
//! hashing, and trackers/DHT are external collaborators: discovery
//! hands a handshaken byte stream to [`torrent::Torrent::add_peer`] and
//! [`peer::PeerConn::start`], hashing drains
//! [`torrent::Torrent::pop_queued_hash_check`] and answers through
//! [`torrent::Torrent::piece_hashed`].

pub mod bandwidth;
pub mod bencode;
pub mod config;
pub mod peer;
pub mod pex;
pub mod pool;
pub mod storage;
pub mod torrent;

pub use bandwidth::{BandwidthLimiter, RateLimiter};
pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{Config, Extensions};
pub use peer::{
    Bitfield, BlockRequest, ConnStats, ExtensionHandshake, Handshake, Message, PeerConn, PeerError,
    PeerId, PeerOptions, PeerSnapshot, PiecePriority,
};
pub use pex::{PexFlags, PexMessage, PexPeer};
pub use pool::ChunkPool;
pub use storage::{MemoryStorage, Storage, StorageError};
pub use torrent::{offset_to_request, Callbacks, DhtServer, Torrent, TorrentInfo, TorrentParams};
