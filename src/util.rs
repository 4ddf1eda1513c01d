use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use rand::RngCore;

/// Determine the local IP address by connecting a UDP socket to an
/// arbitrary external destination and reading back the locally assigned
/// address. No packet is actually sent.
pub fn my_ip() -> Ipv4Addr {
    let fallback = Ipv4Addr::LOCALHOST;

    let Ok(sock) = UdpSocket::bind("0.0.0.0:0") else {
        return fallback;
    };
    if sock.connect("207.106.1.2:42").is_err() {
        return fallback;
    }
    match sock.local_addr() {
        Ok(addr) => match addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => fallback,
        },
        Err(_) => fallback,
    }
}

/// Strict dotted-quad check: four decimal octets, nothing else.
pub fn validate_ip(ip: &str) -> bool {
    let octets: Vec<&str> = ip.split('.').collect();
    octets.len() == 4 && octets.iter().all(|o| o.parse::<u8>().is_ok())
}

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// A random 16-character base32 token (80 bits of entropy), used for the
/// proxy's per-listener credentials.
pub fn auth_token() -> String {
    let mut raw = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut raw);

    let mut out = String::with_capacity(16);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for byte in raw {
        acc = (acc << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[(acc >> bits) as usize & 0x1f] as char);
        }
    }
    out
}

/// Abbreviated swarm id for log output.
pub fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(7)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_ip_accepts_dotted_quads_only() {
        assert!(validate_ip("192.168.0.1"));
        assert!(validate_ip("0.0.0.0"));
        assert!(!validate_ip("1.2.3"));
        assert!(!validate_ip("1.2.3.4.5"));
        assert!(!validate_ip("1.2.3.256"));
        assert!(!validate_ip("example.com"));
        assert!(!validate_ip("::1"));
    }

    #[test]
    fn auth_token_shape() {
        let t = auth_token();
        assert_eq!(t.len(), 16);
        assert!(t.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
        assert_ne!(auth_token(), auth_token());
    }

    #[test]
    fn short_sha_truncates() {
        assert_eq!(short_sha("aaaaaaaaaaaaaaaaaaaa"), "aaaaaaa");
        assert_eq!(short_sha("abc"), "abc");
    }
}
