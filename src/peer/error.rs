use thiserror::Error;

/// Errors that can occur on a peer connection.
///
/// Most variants are protocol violations and fatal to the connection:
/// the reader returns them to the connection supervisor, which closes
/// the peer. Storage failures are handled in place and never surface
/// here.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// Frame length prefix exceeds the accepted maximum.
    #[error("frame too long: {0} bytes")]
    FrameTooLong(usize),

    /// A fast-extension message arrived but fast was not negotiated.
    #[error("fast extension message (id={0}) while fast is disabled")]
    FastDisabled(u8),

    /// A Piece arrived that we no longer consider valid to receive.
    #[error("received unexpected chunk {0:?}")]
    UnexpectedChunk(crate::peer::BlockRequest),

    /// The peer requested a piece we don't have.
    #[error("peer requested piece we don't have: {0}")]
    RequestedMissingPiece(u32),

    /// A request's bounds fall outside the piece.
    #[error("bad request bounds: piece {index} begin {begin} length {length}")]
    BadRequestBounds { index: u32, begin: u32, length: u32 },

    /// The peer claimed a piece index outside the torrent.
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Extension protocol error (unknown id, bad ut_metadata payload, ...).
    #[error("extension error: {0}")]
    Extension(String),

    /// Metadata size signalled by a peer is unusable.
    #[error("bad metadata size: {0}")]
    BadMetadataSize(String),

    /// Error decoding bencode in extension messages.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
