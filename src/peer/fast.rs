//! Allowed-fast set generation (BEP-6).

use sha1::{Digest, Sha1};
use std::net::IpAddr;

/// Deterministically generates the set of pieces a peer may request
/// while choked.
///
/// Both endpoints compute the same set from the peer's masked IP and
/// the info hash, so grants can be verified without trusting the wire.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    set_size: usize,
) -> Vec<u32> {
    if num_pieces == 0 {
        return Vec::new();
    }
    let set_size = set_size.min(num_pieces as usize);

    // IPv4 is masked to /24; IPv6 uses its leading 4 bytes.
    let ip_bytes = match peer_ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], 0]
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], o[3]]
        }
    };

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&ip_bytes);
    x.extend_from_slice(info_hash);

    let mut allowed = Vec::with_capacity(set_size);
    while allowed.len() < set_size {
        let hash = Sha1::digest(&x);
        for chunk in hash.chunks(4) {
            if allowed.len() >= set_size {
                break;
            }
            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % num_pieces;
            if !allowed.contains(&index) {
                allowed.push(index);
            }
        }
        x = hash.to_vec();
    }
    allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        let ih = [7u8; 20];
        let ip: IpAddr = "10.0.1.2".parse().unwrap();
        let a = generate_allowed_fast_set(&ih, ip, 1000, 10);
        let b = generate_allowed_fast_set(&ih, ip, 1000, 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn same_slash_24_same_set() {
        let ih = [7u8; 20];
        let a = generate_allowed_fast_set(&ih, "10.0.1.2".parse().unwrap(), 1000, 10);
        let b = generate_allowed_fast_set(&ih, "10.0.1.200".parse().unwrap(), 1000, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn bounded_by_piece_count() {
        let ih = [1u8; 20];
        let set = generate_allowed_fast_set(&ih, "10.0.0.1".parse().unwrap(), 4, 10);
        assert_eq!(set.len(), 4);
        assert!(set.iter().all(|&i| i < 4));
    }

    #[test]
    fn empty_torrent_empty_set() {
        let ih = [1u8; 20];
        assert!(generate_allowed_fast_set(&ih, "10.0.0.1".parse().unwrap(), 0, 10).is_empty());
    }
}
