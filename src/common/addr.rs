use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::common::{Error, Result};

/// SOCKS5-side target address.
///
/// CONNECT targets coming off the tunnel are always numeric, but RFC 1928
/// servers may answer with a domain-typed BND.ADDR, so both forms are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Encode as `[ATYP][ADDR][PORT]` per RFC 1928.
    /// ATYP: 0x01 = IPv4, 0x03 = domain, 0x04 = IPv6.
    pub fn encode_socks5(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(0x04);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                buf.put_u8(0x03);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// Parse an `[ATYP][ADDR][PORT]` block from the front of a slice.
    /// Returns the address and the number of bytes consumed.
    pub fn parse_socks5(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(Error::Protocol("empty socks5 address".into()));
        }
        match data[0] {
            0x01 => {
                if data.len() < 7 {
                    return Err(Error::Protocol("truncated IPv4 socks5 address".into()));
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            0x03 => {
                if data.len() < 2 {
                    return Err(Error::Protocol("truncated domain socks5 address".into()));
                }
                let len = data[1] as usize;
                if data.len() < 2 + len + 2 {
                    return Err(Error::Protocol("truncated domain socks5 address".into()));
                }
                let domain = String::from_utf8(data[2..2 + len].to_vec())
                    .map_err(|_| Error::Protocol("domain is not valid UTF-8".into()))?;
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((Address::Domain(domain, port), 2 + len + 2))
            }
            0x04 => {
                if data.len() < 19 {
                    return Err(Error::Protocol("truncated IPv6 socks5 address".into()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            atyp => Err(Error::Protocol(format!(
                "unsupported socks5 address type: 0x{atyp:02x}"
            ))),
        }
    }

    /// Resolve to a socket address, using the system resolver for domains.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                tokio::net::lookup_host((domain.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        Error::Protocol(format!("cannot resolve {domain}:{port}"))
                    })
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_ipv4_round_trip() {
        let addr = Address::Ip("8.8.8.8:53".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.encode_socks5(&mut buf);
        assert_eq!(&buf[..], &[0x01, 8, 8, 8, 8, 0, 53]);

        let (parsed, consumed) = Address::parse_socks5(&buf).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn encode_parse_ipv6_round_trip() {
        let addr = Address::Ip("[2001:db8::1]:443".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.encode_socks5(&mut buf);
        assert_eq!(buf[0], 0x04);
        assert_eq!(buf.len(), 19);

        let (parsed, consumed) = Address::parse_socks5(&buf).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, 19);
    }

    #[test]
    fn encode_parse_domain_round_trip() {
        let addr = Address::Domain("example.com".to_string(), 80);
        let mut buf = BytesMut::new();
        addr.encode_socks5(&mut buf);
        assert_eq!(buf[0], 0x03);
        assert_eq!(buf[1], 11);

        let (parsed, consumed) = Address::parse_socks5(&buf).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, 2 + 11 + 2);
    }

    #[test]
    fn parse_truncated_ipv4() {
        assert!(Address::parse_socks5(&[0x01, 1, 2, 3]).is_err());
    }

    #[test]
    fn parse_truncated_ipv6() {
        assert!(Address::parse_socks5(&[0x04; 10]).is_err());
    }

    #[test]
    fn parse_unknown_atyp() {
        assert!(Address::parse_socks5(&[0x7f, 0, 0]).is_err());
    }

    #[test]
    fn display_format() {
        let addr = Address::Ip("1.2.3.4:80".parse().unwrap());
        assert_eq!(format!("{}", addr), "1.2.3.4:80");
        let addr = Address::Domain("proxy.local".to_string(), 1080);
        assert_eq!(format!("{}", addr), "proxy.local:1080");
    }
}
