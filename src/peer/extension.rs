//! Extension protocol handshake (BEP-10).

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use super::error::PeerError;
use crate::bencode::{decode, encode_into, Value};

/// Extended message id 0 is always the handshake.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The id we assign to ut_metadata in our handshake `m` dict.
pub const LOCAL_METADATA_ID: u8 = 1;
/// The id we assign to ut_pex in our handshake `m` dict.
pub const LOCAL_PEX_ID: u8 = 2;

pub const EXTENSION_NAME_METADATA: &str = "ut_metadata";
pub const EXTENSION_NAME_PEX: &str = "ut_pex";

/// The bencoded dictionary exchanged as extended message 0.
///
/// `extensions` preserves zero ids: assigning 0 to a name in an update
/// unregisters that extension for the sender.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    /// The `m` dict: extension name to the sender's message id.
    pub extensions: BTreeMap<String, u8>,
    /// `v`: client name and version.
    pub client: Option<String>,
    /// `p`: the sender's listen port.
    pub port: Option<u16>,
    /// `yourip`: how the sender sees our address (compact form).
    pub yourip: Option<Vec<u8>>,
    /// `reqq`: how many requests the sender will queue from us.
    pub reqq: Option<i64>,
    /// `metadata_size`: total info-dictionary size in bytes.
    pub metadata_size: Option<i64>,
    /// `e`: the sender prefers encrypted connections.
    pub prefers_encryption: bool,
}

impl ExtensionHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the handshake we send, advertising ut_metadata and ut_pex.
    pub fn ours(config: &crate::config::Config, metadata_size: Option<usize>) -> Self {
        let mut hs = Self::new();
        hs.extensions
            .insert(EXTENSION_NAME_METADATA.to_string(), LOCAL_METADATA_ID);
        if !config.disable_pex {
            hs.extensions
                .insert(EXTENSION_NAME_PEX.to_string(), LOCAL_PEX_ID);
        }
        hs.client = Some(config.client_name.clone());
        if config.listen_port != 0 {
            hs.port = Some(config.listen_port);
        }
        hs.reqq = Some(config.local_reqq as i64);
        hs.metadata_size = metadata_size.map(|n| n as i64);
        hs.prefers_encryption = config.prefers_encryption;
        hs
    }

    pub fn encode(&self) -> Bytes {
        let mut dict = BTreeMap::new();

        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(
                Bytes::copy_from_slice(name.as_bytes()),
                Value::Integer(*id as i64),
            );
        }
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));

        if let Some(ref client) = self.client {
            dict.insert(Bytes::from_static(b"v"), Value::string(client));
        }
        if let Some(port) = self.port {
            dict.insert(Bytes::from_static(b"p"), Value::Integer(port as i64));
        }
        if let Some(ref ip) = self.yourip {
            dict.insert(
                Bytes::from_static(b"yourip"),
                Value::Bytes(Bytes::copy_from_slice(ip)),
            );
        }
        if let Some(reqq) = self.reqq {
            dict.insert(Bytes::from_static(b"reqq"), Value::Integer(reqq));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Integer(size));
        }
        if self.prefers_encryption {
            dict.insert(Bytes::from_static(b"e"), Value::Integer(1));
        }

        let mut buf = BytesMut::new();
        encode_into(&Value::Dict(dict), &mut buf);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("handshake is not a dict".into()))?;

        let mut hs = Self::new();

        if let Some(m) = dict.get(b"m".as_slice()).and_then(Value::as_dict) {
            for (key, val) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer()) {
                    // Keep zeros: id 0 in an update unregisters the name.
                    if (0..=255).contains(&id) {
                        hs.extensions.insert(name.to_string(), id as u8);
                    }
                }
            }
        }

        hs.client = dict
            .get(b"v".as_slice())
            .and_then(Value::as_str)
            .map(String::from);
        hs.port = dict
            .get(b"p".as_slice())
            .and_then(Value::as_integer)
            .filter(|&p| (1..=65535).contains(&p))
            .map(|p| p as u16);
        hs.yourip = dict
            .get(b"yourip".as_slice())
            .and_then(Value::as_bytes)
            .map(|b| b.to_vec());
        hs.reqq = dict.get(b"reqq".as_slice()).and_then(Value::as_integer);
        hs.metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(Value::as_integer);
        hs.prefers_encryption = dict
            .get(b"e".as_slice())
            .and_then(Value::as_integer)
            .unwrap_or(0)
            != 0;

        Ok(hs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut hs = ExtensionHandshake::new();
        hs.extensions.insert("ut_metadata".to_string(), 1);
        hs.extensions.insert("ut_pex".to_string(), 2);
        hs.client = Some("peerwire/0.1.0".to_string());
        hs.port = Some(6881);
        hs.reqq = Some(250);
        hs.metadata_size = Some(31235);
        hs.prefers_encryption = true;

        let decoded = ExtensionHandshake::decode(&hs.encode()).unwrap();
        assert_eq!(decoded.extensions.get("ut_metadata"), Some(&1));
        assert_eq!(decoded.extensions.get("ut_pex"), Some(&2));
        assert_eq!(decoded.client.as_deref(), Some("peerwire/0.1.0"));
        assert_eq!(decoded.port, Some(6881));
        assert_eq!(decoded.reqq, Some(250));
        assert_eq!(decoded.metadata_size, Some(31235));
        assert!(decoded.prefers_encryption);
    }

    #[test]
    fn zero_id_survives_decode() {
        let mut hs = ExtensionHandshake::new();
        hs.extensions.insert("ut_pex".to_string(), 0);
        let decoded = ExtensionHandshake::decode(&hs.encode()).unwrap();
        assert_eq!(decoded.extensions.get("ut_pex"), Some(&0));
    }

    #[test]
    fn rejects_non_dict() {
        assert!(ExtensionHandshake::decode(b"i1e").is_err());
        assert!(ExtensionHandshake::decode(b"garbage").is_err());
    }
}
