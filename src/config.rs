//! Session tunables consumed by the peer connection core.
//!
//! Defaults follow common client behaviour (libtorrent, qBittorrent,
//! Transmission) where a value is not fixed by a BEP.

use std::time::Duration;

/// Standard chunk (block) size requested from peers (16 KiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 16384;

/// Maximum frame length the decoder accepts. Larger frames fail the
/// connection. Covers a full chunk plus the Piece header with headroom
/// for bitfields of very large torrents.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Maximum concurrent requests we accept from a single peer
/// (libtorrent default: 250).
pub const LOCAL_CLIENT_REQQ: usize = 250;

/// Maximum pending requests assumed for a peer until its extension
/// handshake says otherwise.
pub const DEFAULT_PEER_MAX_REQUESTS: usize = 250;

/// Number of allowed-fast pieces granted to a peer (BEP-6 suggests 10).
pub const ALLOWED_FAST_SET_SIZE: usize = 10;

/// Metadata transfers larger than this are refused outright.
pub const MAX_METADATA_SIZE: usize = 16 << 20;

/// How far net upload may exceed net download to a peer before we stop
/// serving it (leecher mode only).
pub const UPLOAD_PAYLOAD_ALLOWANCE: u64 = 100 << 10;

/// Idle interval after which the writer emits a keepalive.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Minimum spacing between PEX deltas on one connection (BEP-11).
pub const PEX_SHARE_INTERVAL: Duration = Duration::from_secs(60);

/// Protocol extensions this client is willing to negotiate.
#[derive(Debug, Clone, Copy)]
pub struct Extensions {
    /// Fast extension (BEP-6).
    pub supports_fast: bool,
    /// Extension protocol (BEP-10), required for ut_metadata and ut_pex.
    pub supports_extended: bool,
    /// DHT port announcement (BEP-5).
    pub supports_dht: bool,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            supports_fast: true,
            supports_extended: true,
            supports_dht: false,
        }
    }
}

/// Configuration for a torrent's peer connections.
#[derive(Debug, Clone)]
pub struct Config {
    /// Disable all uploading, globally.
    pub no_upload: bool,
    /// Disable data upload for this torrent while still serving metadata.
    pub data_upload_disallowed: bool,
    /// Do not negotiate or answer ut_pex.
    pub disable_pex: bool,
    /// Close connections where both ends are complete.
    pub drop_mutually_complete_peers: bool,
    pub extensions: Extensions,
    /// Client name advertised in the extended handshake `v` field.
    pub client_name: String,
    /// TCP listen port advertised in the extended handshake `p` field.
    pub listen_port: u16,
    /// Whether we prefer encrypted connections (`e` field).
    pub prefers_encryption: bool,
    pub keep_alive_interval: Duration,
    pub local_reqq: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            no_upload: false,
            data_upload_disallowed: false,
            disable_pex: false,
            drop_mutually_complete_peers: false,
            extensions: Extensions::default(),
            client_name: format!("peerwire/{}", env!("CARGO_PKG_VERSION")),
            listen_port: 0,
            prefers_encryption: false,
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            local_reqq: LOCAL_CLIENT_REQQ,
        }
    }
}
