//! PROXY protocol header generation
//!
//! When a proxy is configured with `proxy_protocol_version`, the client
//! writes one header to the local service before forwarding any user bytes,
//! so the service sees the real source address. The family selector follows
//! the actual address family of the source.

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocolVersion {
    V1,
    V2,
}

impl ProxyProtocolVersion {
    /// Parse the configuration value; empty means disabled.
    pub fn parse(s: &str) -> Result<Option<Self>> {
        match s {
            "" => Ok(None),
            "v1" => Ok(Some(ProxyProtocolVersion::V1)),
            "v2" => Ok(Some(ProxyProtocolVersion::V2)),
            other => Err(Error::Config(format!(
                "proxy_protocol_version must be v1 or v2, got {}",
                other
            ))),
        }
    }
}

/// Encode one PROXY protocol header for a TCP connection from `src` to `dst`.
pub fn encode_header(
    version: ProxyProtocolVersion,
    src: SocketAddr,
    dst: SocketAddr,
) -> Vec<u8> {
    match version {
        ProxyProtocolVersion::V1 => encode_v1(src, dst),
        ProxyProtocolVersion::V2 => encode_v2(src, dst),
    }
}

fn encode_v1(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let (family, src, dst) = normalize(src, dst);
    let family = match family {
        Family::V4 => "TCP4",
        Family::V6 => "TCP6",
    };
    format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    )
    .into_bytes()
}

fn encode_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let (family, src, dst) = normalize(src, dst);
    let mut out = Vec::with_capacity(16 + 36);
    out.extend_from_slice(&V2_SIGNATURE);
    out.push(0x21); // version 2, command PROXY

    match family {
        Family::V4 => {
            out.push(0x11); // AF_INET, STREAM
            out.extend_from_slice(&12u16.to_be_bytes());
            match (src.ip(), dst.ip()) {
                (IpAddr::V4(s), IpAddr::V4(d)) => {
                    out.extend_from_slice(&s.octets());
                    out.extend_from_slice(&d.octets());
                }
                _ => unreachable!("normalize produced mismatched families"),
            }
        }
        Family::V6 => {
            out.push(0x21); // AF_INET6, STREAM
            out.extend_from_slice(&36u16.to_be_bytes());
            match (src.ip(), dst.ip()) {
                (IpAddr::V6(s), IpAddr::V6(d)) => {
                    out.extend_from_slice(&s.octets());
                    out.extend_from_slice(&d.octets());
                }
                _ => unreachable!("normalize produced mismatched families"),
            }
        }
    }
    out.extend_from_slice(&src.port().to_be_bytes());
    out.extend_from_slice(&dst.port().to_be_bytes());
    out
}

enum Family {
    V4,
    V6,
}

/// Pick the address family from the source address; a mixed pair is lifted
/// to IPv6 with v4-mapped addresses.
fn normalize(src: SocketAddr, dst: SocketAddr) -> (Family, SocketAddr, SocketAddr) {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(_), IpAddr::V4(_)) => (Family::V4, src, dst),
        (IpAddr::V6(_), IpAddr::V6(_)) => (Family::V6, src, dst),
        _ => {
            let lift = |addr: SocketAddr| -> SocketAddr {
                match addr.ip() {
                    IpAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
                    IpAddr::V6(_) => addr,
                }
            };
            (Family::V6, lift(src), lift(dst))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(ProxyProtocolVersion::parse("").unwrap(), None);
        assert_eq!(
            ProxyProtocolVersion::parse("v1").unwrap(),
            Some(ProxyProtocolVersion::V1)
        );
        assert_eq!(
            ProxyProtocolVersion::parse("v2").unwrap(),
            Some(ProxyProtocolVersion::V2)
        );
        assert!(ProxyProtocolVersion::parse("v3").is_err());
    }

    #[test]
    fn test_v1_tcp4() {
        let header = encode_header(
            ProxyProtocolVersion::V1,
            "192.0.2.1:56324".parse().unwrap(),
            "198.51.100.7:443".parse().unwrap(),
        );
        assert_eq!(
            header,
            b"PROXY TCP4 192.0.2.1 198.51.100.7 56324 443\r\n"
        );
    }

    #[test]
    fn test_v1_tcp6() {
        let header = encode_header(
            ProxyProtocolVersion::V1,
            "[2001:db8::1]:9000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );
        let text = String::from_utf8(header).unwrap();
        assert!(text.starts_with("PROXY TCP6 2001:db8::1 2001:db8::2 9000 443"));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn test_v2_tcp4_layout() {
        let header = encode_header(
            ProxyProtocolVersion::V2,
            "10.1.1.1:1000".parse().unwrap(),
            "10.2.2.2:2000".parse().unwrap(),
        );
        assert_eq!(&header[..12], &V2_SIGNATURE);
        assert_eq!(header[12], 0x21);
        assert_eq!(header[13], 0x11);
        assert_eq!(u16::from_be_bytes([header[14], header[15]]), 12);
        assert_eq!(&header[16..20], &[10, 1, 1, 1]);
        assert_eq!(&header[20..24], &[10, 2, 2, 2]);
        assert_eq!(u16::from_be_bytes([header[24], header[25]]), 1000);
        assert_eq!(u16::from_be_bytes([header[26], header[27]]), 2000);
        assert_eq!(header.len(), 28);
    }

    #[test]
    fn test_v2_tcp6_layout() {
        let header = encode_header(
            ProxyProtocolVersion::V2,
            "[::1]:1000".parse().unwrap(),
            "[::2]:2000".parse().unwrap(),
        );
        assert_eq!(header[13], 0x21);
        assert_eq!(u16::from_be_bytes([header[14], header[15]]), 36);
        assert_eq!(header.len(), 16 + 36);
    }

    #[test]
    fn test_mixed_families_lifted_to_v6() {
        let header = encode_header(
            ProxyProtocolVersion::V2,
            "192.0.2.1:1000".parse().unwrap(),
            "[2001:db8::2]:2000".parse().unwrap(),
        );
        assert_eq!(header[13], 0x21, "must select the IPv6 family");
    }
}
