use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::PeerError;
use crate::pool::ChunkPool;

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Message type identifiers in the peer wire protocol.
///
/// Each message (except the keepalive) has a one-byte ID following the
/// length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    /// DHT port announcement (BEP-5).
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    /// Extension protocol envelope (BEP-10).
    Extended = 20,
}

impl MessageId {
    /// True for the message types the fast extension adds. Receiving
    /// one without fast negotiated fails the connection.
    pub fn is_fast_extension(self) -> bool {
        matches!(
            self,
            MessageId::Suggest
                | MessageId::HaveAll
                | MessageId::HaveNone
                | MessageId::Reject
                | MessageId::AllowedFast
        )
    }
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            13 => Ok(MessageId::Suggest),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            _ => Err(PeerError::UnknownMessageId(value)),
        }
    }
}

/// The BitTorrent handshake: protocol string, reserved capability bits,
/// info hash, and peer ID.
///
/// Reserved bits used here:
/// - byte 5, bit 0x10: extension protocol (BEP-10)
/// - byte 7, bit 0x04: fast extension (BEP-6)
/// - byte 7, bit 0x01: DHT (BEP-5)
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Creates a handshake advertising the given capability set.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], ext: crate::config::Extensions) -> Self {
        let mut reserved = [0u8; 8];
        if ext.supports_extended {
            reserved[5] |= 0x10;
        }
        if ext.supports_fast {
            reserved[7] |= 0x04;
        }
        if ext.supports_dht {
            reserved[7] |= 0x01;
        }
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        (self.reserved[7] & 0x04) != 0
    }

    pub fn supports_dht(&self) -> bool {
        (self.reserved[7] & 0x01) != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN || data[0] != 19 || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A peer wire protocol message.
///
/// Messages are length-prefixed: a 4-byte big-endian length followed by
/// a 1-byte message ID (except the keepalive, which has length 0) and
/// payload.
#[derive(Debug, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Encodes the message, including the length prefix, to a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the encoded message, including the length prefix, to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_bare(buf, MessageId::Choke),
            Message::Unchoke => put_bare(buf, MessageId::Unchoke),
            Message::Interested => put_bare(buf, MessageId::Interested),
            Message::NotInterested => put_bare(buf, MessageId::NotInterested),
            Message::Have { piece } => put_index(buf, MessageId::Have, *piece),
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => put_request(buf, MessageId::Request, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => put_request(buf, MessageId::Cancel, *index, *begin, *length),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::Suggest { piece } => put_index(buf, MessageId::Suggest, *piece),
            Message::HaveAll => put_bare(buf, MessageId::HaveAll),
            Message::HaveNone => put_bare(buf, MessageId::HaveNone),
            Message::Reject {
                index,
                begin,
                length,
            } => put_request(buf, MessageId::Reject, *index, *begin, *length),
            Message::AllowedFast { piece } => put_index(buf, MessageId::AllowedFast, *piece),
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
    }

    /// The wire message ID, or `None` for the keepalive.
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
            Message::Suggest { .. } => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject { .. } => MessageId::Reject,
            Message::AllowedFast { .. } => MessageId::AllowedFast,
            Message::Extended { .. } => MessageId::Extended,
        })
    }

    /// Decodes one complete frame (length prefix included) from `data`.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("frame too short".into()));
        }
        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() < length {
            return Err(PeerError::InvalidMessage("incomplete frame".into()));
        }
        let id = MessageId::try_from(data.get_u8())?;
        Self::decode_body(id, length, data)
    }

    fn decode_body(id: MessageId, length: usize, mut data: Bytes) -> Result<Self, PeerError> {
        let need = |n: usize| {
            if data.remaining() < n {
                Err(PeerError::InvalidMessage(format!("{:?} too short", id)))
            } else {
                Ok(())
            }
        };
        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                need(4)?;
                Ok(Message::Have {
                    piece: data.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(length - 1))),
            MessageId::Request => {
                need(12)?;
                Ok(Message::Request {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Piece => {
                need(8)?;
                let index = data.get_u32();
                let begin = data.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: data.copy_to_bytes(length - 9),
                })
            }
            MessageId::Cancel => {
                need(12)?;
                Ok(Message::Cancel {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Port => {
                need(2)?;
                Ok(Message::Port(data.get_u16()))
            }
            MessageId::Suggest => {
                need(4)?;
                Ok(Message::Suggest {
                    piece: data.get_u32(),
                })
            }
            MessageId::HaveAll => Ok(Message::HaveAll),
            MessageId::HaveNone => Ok(Message::HaveNone),
            MessageId::Reject => {
                need(12)?;
                Ok(Message::Reject {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::AllowedFast => {
                need(4)?;
                Ok(Message::AllowedFast {
                    piece: data.get_u32(),
                })
            }
            MessageId::Extended => {
                need(1)?;
                let ext_id = data.get_u8();
                Ok(Message::Extended {
                    id: ext_id,
                    payload: data.copy_to_bytes(length - 2),
                })
            }
        }
    }
}

fn put_bare(buf: &mut BytesMut, id: MessageId) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

fn put_index(buf: &mut BytesMut, id: MessageId, piece: u32) {
    buf.put_u32(5);
    buf.put_u8(id as u8);
    buf.put_u32(piece);
}

fn put_request(buf: &mut BytesMut, id: MessageId, index: u32, begin: u32, length: u32) {
    buf.put_u32(13);
    buf.put_u8(id as u8);
    buf.put_u32(index);
    buf.put_u32(begin);
    buf.put_u32(length);
}

/// Reads length-prefixed frames off a byte stream, one message at a time.
///
/// Frames longer than `max_frame_len` fail the connection. `Piece`
/// payloads are read into buffers borrowed from the torrent's chunk
/// pool; the receive path returns them via [`ChunkPool::put`].
pub struct FrameDecoder<R> {
    reader: R,
    pool: Arc<ChunkPool>,
    max_frame_len: usize,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameDecoder<R> {
    pub fn new(reader: R, pool: Arc<ChunkPool>, max_frame_len: usize) -> Self {
        Self {
            reader,
            pool,
            max_frame_len,
            bytes_read: 0,
        }
    }

    /// Raw bytes consumed off the stream so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads the next message. EOF at a frame boundary surfaces as
    /// [`PeerError::ConnectionClosed`].
    pub async fn read_message(&mut self) -> Result<Message, PeerError> {
        let mut prefix = [0u8; 4];
        match self.reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(PeerError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_be_bytes(prefix) as usize;
        if length == 0 {
            self.bytes_read += 4;
            return Ok(Message::KeepAlive);
        }
        if length > self.max_frame_len {
            return Err(PeerError::FrameTooLong(length));
        }
        self.bytes_read += 4 + length as u64;

        let mut id_byte = [0u8; 1];
        self.reader.read_exact(&mut id_byte).await?;
        let id = MessageId::try_from(id_byte[0])?;

        if id == MessageId::Piece {
            if length < 9 {
                return Err(PeerError::InvalidMessage("piece too short".into()));
            }
            let mut header = [0u8; 8];
            self.reader.read_exact(&mut header).await?;
            let index = u32::from_be_bytes(header[0..4].try_into().unwrap());
            let begin = u32::from_be_bytes(header[4..8].try_into().unwrap());
            let mut payload = self.pool.get();
            payload.resize(length - 9, 0);
            self.reader.read_exact(&mut payload).await?;
            return Ok(Message::Piece {
                index,
                begin,
                data: payload.freeze(),
            });
        }

        let mut body = vec![0u8; length - 1];
        self.reader.read_exact(&mut body).await?;
        Message::decode_body(id, length, Bytes::from(body))
    }
}
