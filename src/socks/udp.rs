use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::common::Address;

/// Prepend the RFC 1928 UDP request header to a datagram payload.
///
/// `RSV=0x0000 FRAG=0x00 ATYP ADDR PORT DATA`. Fragmentation is never
/// produced.
pub fn encap(dst: SocketAddr, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(22 + payload.len());
    buf.put_slice(&[0x00, 0x00, 0x00]);
    Address::Ip(dst).encode_socks5(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Strip and validate the UDP request header from a relayed datagram.
///
/// Returns the inner source endpoint and the payload, or `None` when the
/// wrapper is unusable (nonzero RSV, fragmented, domain or unknown ATYP,
/// truncated) — callers drop such datagrams.
pub fn decap(data: &[u8]) -> Option<(SocketAddr, &[u8])> {
    if data.len() < 4 || data[0] != 0 || data[1] != 0 || data[2] != 0 {
        return None;
    }
    if data[3] != 0x01 && data[3] != 0x04 {
        return None;
    }
    let (addr, consumed) = Address::parse_socks5(&data[3..]).ok()?;
    let Address::Ip(addr) = addr else {
        return None;
    };
    Some((addr, &data[3 + consumed..]))
}
