//! Peer wire protocol and connection core (BEP-3, BEP-6, BEP-9, BEP-10).
//!
//! This module implements the full-duplex protocol session with a
//! single remote peer: the wire codec, per-connection state, the
//! outbound request ledger, the inbound dispatcher, the notify-driven
//! writer, the upload server, and ut_metadata exchange.

mod bitfield;
mod conn;
mod error;
mod extension;
mod fast;
mod message;
mod metadata;
mod order;
mod peer_id;
mod requests;
mod state;

pub use bitfield::Bitfield;
pub use conn::{PeerConn, PeerOptions};
pub use error::PeerError;
pub use extension::{
    ExtensionHandshake, EXTENSION_HANDSHAKE_ID, EXTENSION_NAME_METADATA, EXTENSION_NAME_PEX,
    LOCAL_METADATA_ID, LOCAL_PEX_ID,
};
pub use fast::generate_allowed_fast_set;
pub use message::{FrameDecoder, Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL};
pub use metadata::{
    metadata_piece_count, metadata_piece_len, MetadataMessage, MetadataMessageType,
    METADATA_PIECE_SIZE,
};
pub use order::{PiecePriority, RequestOrder};
pub use peer_id::PeerId;
pub use requests::{BlockRequest, PendingRequests, RequestRefusal};
pub use state::{
    ConnStats, ConnectionTrust, CryptoMethod, CryptoState, Network, Peer, PeerKey, PeerSnapshot,
    PeerSource,
};
