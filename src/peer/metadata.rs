//! Metadata exchange (ut_metadata, BEP-9).
//!
//! Transfers the raw info-dictionary bytes out of band so a torrent
//! opened from an info hash alone can acquire its metadata from peers.
//! The wire format is a bencoded header dictionary; `data` messages
//! append the raw piece bytes after the dictionary.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use super::error::PeerError;
use crate::bencode::{decode_prefix, encode_into, Value};

/// The size of a metadata piece (16 KiB).
pub const METADATA_PIECE_SIZE: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MetadataMessageType::Request),
            1 => Some(MetadataMessageType::Data),
            2 => Some(MetadataMessageType::Reject),
            _ => None,
        }
    }
}

/// A ut_metadata message: request, data, or reject for one 16 KiB piece
/// of the info dictionary.
#[derive(Debug, Clone)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    /// Total metadata size; present on data messages.
    pub total_size: Option<u32>,
    /// The piece bytes; present on data messages.
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: u32, total_size: u32, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"msg_type"),
            Value::Integer(self.msg_type as u8 as i64),
        );
        dict.insert(
            Bytes::from_static(b"piece"),
            Value::Integer(self.piece as i64),
        );
        if let Some(total_size) = self.total_size {
            dict.insert(
                Bytes::from_static(b"total_size"),
                Value::Integer(total_size as i64),
            );
        }

        let mut buf = BytesMut::new();
        encode_into(&Value::Dict(dict), &mut buf);
        if let Some(ref data) = self.data {
            buf.extend_from_slice(data);
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, used) = decode_prefix(payload)?;
        let dict = header
            .as_dict()
            .ok_or_else(|| PeerError::Extension("ut_metadata header is not a dict".into()))?;

        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(Value::as_integer)
            .and_then(|t| u8::try_from(t).ok())
            .and_then(MetadataMessageType::from_byte)
            .ok_or_else(|| PeerError::Extension("bad ut_metadata msg_type".into()))?;

        let piece = dict
            .get(b"piece".as_slice())
            .and_then(Value::as_integer)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| PeerError::Extension("missing ut_metadata piece".into()))?;

        let total_size = dict
            .get(b"total_size".as_slice())
            .and_then(Value::as_integer)
            .and_then(|s| u32::try_from(s).ok());

        let data = if msg_type == MetadataMessageType::Data && used < payload.len() {
            Some(Bytes::copy_from_slice(&payload[used..]))
        } else {
            None
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

/// Number of 16 KiB pieces covering `metadata_size` bytes.
pub fn metadata_piece_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_PIECE_SIZE)
}

/// Byte length of metadata piece `piece` for the given total size.
pub fn metadata_piece_len(piece: u32, total_size: usize) -> usize {
    let offset = piece as usize * METADATA_PIECE_SIZE;
    total_size.saturating_sub(offset).min(METADATA_PIECE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let decoded = MetadataMessage::decode(&MetadataMessage::request(5).encode()).unwrap();
        assert_eq!(decoded.msg_type, MetadataMessageType::Request);
        assert_eq!(decoded.piece, 5);
        assert!(decoded.total_size.is_none());
        assert!(decoded.data.is_none());
    }

    #[test]
    fn data_round_trip() {
        let data = Bytes::from_static(b"d4:infoi1ee");
        let msg = MetadataMessage::data(2, 1000, data.clone());
        let decoded = MetadataMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.msg_type, MetadataMessageType::Data);
        assert_eq!(decoded.piece, 2);
        assert_eq!(decoded.total_size, Some(1000));
        assert_eq!(decoded.data, Some(data));
    }

    #[test]
    fn reject_round_trip() {
        let decoded = MetadataMessage::decode(&MetadataMessage::reject(10).encode()).unwrap();
        assert_eq!(decoded.msg_type, MetadataMessageType::Reject);
        assert_eq!(decoded.piece, 10);
    }

    #[test]
    fn piece_counts() {
        assert_eq!(metadata_piece_count(0), 0);
        assert_eq!(metadata_piece_count(1), 1);
        assert_eq!(metadata_piece_count(16384), 1);
        assert_eq!(metadata_piece_count(16385), 2);
        assert_eq!(metadata_piece_len(0, 16385), 16384);
        assert_eq!(metadata_piece_len(1, 16385), 1);
        assert_eq!(metadata_piece_len(2, 16385), 0);
    }
}
