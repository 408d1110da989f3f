//! Peer Exchange (ut_pex, BEP-11).
//!
//! Connected peers periodically exchange compact peer lists over the
//! extension protocol: `added`/`added6` carry new peers with one flag
//! byte each, `dropped`/`dropped6` carry departures. Each connection
//! tracks what it already shared and sends deltas.

use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::bencode::{decode, encode, Value};
use crate::config::PEX_SHARE_INTERVAL;
use crate::peer::PeerError;

/// Capability flags attached to each exchanged peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PexFlags {
    pub prefers_encryption: bool,
    pub seed: bool,
    pub utp: bool,
    pub holepunch: bool,
    pub outgoing: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            prefers_encryption: (b & 0x01) != 0,
            seed: (b & 0x02) != 0,
            utp: (b & 0x04) != 0,
            holepunch: (b & 0x08) != 0,
            outgoing: (b & 0x10) != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.prefers_encryption {
            b |= 0x01;
        }
        if self.seed {
            b |= 0x02;
        }
        if self.utp {
            b |= 0x04;
        }
        if self.holepunch {
            b |= 0x08;
        }
        if self.outgoing {
            b |= 0x10;
        }
        b
    }
}

/// A peer learned or announced through PEX.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: PexFlags,
}

/// One ut_pex update: additions and departures, v4 and v6 separately.
#[derive(Debug, Clone, Default)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub added6: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
    pub dropped6: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, peer: PexPeer) {
        match peer.addr {
            SocketAddr::V4(_) => self.added.push(peer),
            SocketAddr::V6(_) => self.added6.push(peer),
        }
    }

    pub fn drop_peer(&mut self, addr: SocketAddr) {
        match addr {
            SocketAddr::V4(_) => self.dropped.push(addr),
            SocketAddr::V6(_) => self.dropped6.push(addr),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.added6.is_empty()
            && self.dropped.is_empty()
            && self.dropped6.is_empty()
    }

    /// Encodes the bencoded extended-message payload.
    pub fn encode_payload(&self) -> Bytes {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"added"),
            Value::Bytes(compact_v4(self.added.iter().map(|p| p.addr))),
        );
        dict.insert(
            Bytes::from_static(b"added.f"),
            Value::Bytes(flag_bytes(&self.added)),
        );
        dict.insert(
            Bytes::from_static(b"added6"),
            Value::Bytes(compact_v6(self.added6.iter().map(|p| p.addr))),
        );
        dict.insert(
            Bytes::from_static(b"added6.f"),
            Value::Bytes(flag_bytes(&self.added6)),
        );
        dict.insert(
            Bytes::from_static(b"dropped"),
            Value::Bytes(compact_v4(self.dropped.iter().copied())),
        );
        dict.insert(
            Bytes::from_static(b"dropped6"),
            Value::Bytes(compact_v6(self.dropped6.iter().copied())),
        );
        encode(&Value::Dict(dict))
    }

    /// Decodes a bencoded ut_pex payload. Missing keys decode as empty.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, PeerError> {
        let value = decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("ut_pex payload is not a dict".into()))?;

        let field = |key: &[u8]| {
            dict.get(key)
                .and_then(Value::as_bytes)
                .map(|b| b.as_ref())
                .unwrap_or(&[])
        };

        Ok(Self {
            added: decode_added_v4(field(b"added"), field(b"added.f")),
            added6: decode_added_v6(field(b"added6"), field(b"added6.f")),
            dropped: decode_dropped_v4(field(b"dropped")),
            dropped6: decode_dropped_v6(field(b"dropped6")),
        })
    }
}

fn compact_v4(addrs: impl Iterator<Item = SocketAddr>) -> Bytes {
    let mut buf = BytesMut::new();
    for addr in addrs {
        if let SocketAddr::V4(a) = addr {
            buf.put_slice(&a.ip().octets());
            buf.put_u16(a.port());
        }
    }
    buf.freeze()
}

fn compact_v6(addrs: impl Iterator<Item = SocketAddr>) -> Bytes {
    let mut buf = BytesMut::new();
    for addr in addrs {
        if let SocketAddr::V6(a) = addr {
            buf.put_slice(&a.ip().octets());
            buf.put_u16(a.port());
        }
    }
    buf.freeze()
}

fn flag_bytes(peers: &[PexPeer]) -> Bytes {
    peers.iter().map(|p| p.flags.to_byte()).collect::<Vec<_>>().into()
}

fn decode_added_v4(data: &[u8], flags: &[u8]) -> Vec<PexPeer> {
    data.chunks_exact(6)
        .enumerate()
        .map(|(i, c)| PexPeer {
            addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(c[0], c[1], c[2], c[3]),
                u16::from_be_bytes([c[4], c[5]]),
            )),
            flags: flags.get(i).copied().map(PexFlags::from_byte).unwrap_or_default(),
        })
        .collect()
}

fn decode_added_v6(data: &[u8], flags: &[u8]) -> Vec<PexPeer> {
    data.chunks_exact(18)
        .enumerate()
        .map(|(i, c)| {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&c[..16]);
            PexPeer {
                addr: SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(ip),
                    u16::from_be_bytes([c[16], c[17]]),
                    0,
                    0,
                )),
                flags: flags.get(i).copied().map(PexFlags::from_byte).unwrap_or_default(),
            }
        })
        .collect()
}

fn decode_dropped_v4(data: &[u8]) -> Vec<SocketAddr> {
    decode_added_v4(data, &[]).into_iter().map(|p| p.addr).collect()
}

fn decode_dropped_v6(data: &[u8]) -> Vec<SocketAddr> {
    decode_added_v6(data, &[]).into_iter().map(|p| p.addr).collect()
}

/// Per-connection PEX state.
///
/// Enabled once both sides advertise ut_pex. The first share sends the
/// full current peer list; later shares send deltas against `sent`, no
/// more often than [`PEX_SHARE_INTERVAL`].
#[derive(Debug, Default)]
pub struct PexConnState {
    enabled: bool,
    last_share: Option<Instant>,
    sent: HashSet<SocketAddr>,
}

impl PexConnState {
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn close(&mut self) {
        self.enabled = false;
        self.sent.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Computes the next update for the given live peer list, or `None`
    /// if disabled, rate-limited, or nothing changed.
    pub fn share(&mut self, live: &[PexPeer]) -> Option<PexMessage> {
        if !self.enabled {
            return None;
        }
        if let Some(last) = self.last_share {
            if last.elapsed() < PEX_SHARE_INTERVAL {
                return None;
            }
        }

        let current: HashSet<SocketAddr> = live.iter().map(|p| p.addr).collect();
        let mut msg = PexMessage::new();
        for peer in live {
            if !self.sent.contains(&peer.addr) {
                msg.add_peer(peer.clone());
            }
        }
        for addr in self.sent.difference(&current) {
            msg.drop_peer(*addr);
        }
        if msg.is_empty() {
            // Nothing new; try again next interval.
            self.last_share = Some(Instant::now());
            return None;
        }
        self.sent = current;
        self.last_share = Some(Instant::now());
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn flags_round_trip() {
        let flags = PexFlags {
            prefers_encryption: true,
            utp: true,
            ..Default::default()
        };
        assert_eq!(PexFlags::from_byte(flags.to_byte()), flags);
    }

    #[test]
    fn payload_round_trip() {
        let mut msg = PexMessage::new();
        msg.add_peer(PexPeer {
            addr: v4("192.168.1.1:6881"),
            flags: PexFlags {
                seed: true,
                ..Default::default()
            },
        });
        msg.add_peer(PexPeer {
            addr: "[2001:db8::1]:51413".parse().unwrap(),
            flags: PexFlags::default(),
        });
        msg.drop_peer(v4("10.0.0.1:1000"));

        let decoded = PexMessage::decode_payload(&msg.encode_payload()).unwrap();
        assert_eq!(decoded.added.len(), 1);
        assert_eq!(decoded.added[0].addr, v4("192.168.1.1:6881"));
        assert!(decoded.added[0].flags.seed);
        assert_eq!(decoded.added6.len(), 1);
        assert_eq!(decoded.dropped, vec![v4("10.0.0.1:1000")]);
    }

    #[test]
    fn share_sends_initial_then_deltas() {
        let mut state = PexConnState::default();
        state.enable();

        let a = PexPeer {
            addr: v4("1.1.1.1:1"),
            flags: PexFlags::default(),
        };
        let b = PexPeer {
            addr: v4("2.2.2.2:2"),
            flags: PexFlags::default(),
        };

        let first = state.share(&[a.clone()]).unwrap();
        assert_eq!(first.added.len(), 1);

        // Within the interval nothing more is shared.
        assert!(state.share(&[a.clone(), b.clone()]).is_none());

        state.last_share = Some(Instant::now() - PEX_SHARE_INTERVAL * 2);
        let second = state.share(&[b]).unwrap();
        assert_eq!(second.added.len(), 1);
        assert_eq!(second.added[0].addr, v4("2.2.2.2:2"));
        assert_eq!(second.dropped, vec![v4("1.1.1.1:1")]);
    }

    #[test]
    fn disabled_never_shares() {
        let mut state = PexConnState::default();
        assert!(state
            .share(&[PexPeer {
                addr: v4("1.1.1.1:1"),
                flags: PexFlags::default(),
            }])
            .is_none());
    }
}
