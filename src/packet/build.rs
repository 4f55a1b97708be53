use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use super::checksum;
use super::ipv4::{IPPROTO_TCP, IPPROTO_UDP};
use super::tcp::TcpFlags;

const TTL: u8 = 64;
const DONT_FRAGMENT: u16 = 0x4000;
/// Window advertised on every synthesized segment. Flow control toward the
/// peer rides on the upstream socket's own backpressure, not this value.
const WINDOW: u16 = 0xffff;

static NEXT_IDENT: AtomicU16 = AtomicU16::new(1);

/// Monotonic identification sequence shared by all synthesized packets.
pub fn next_ident() -> u16 {
    NEXT_IDENT.fetch_add(1, Ordering::Relaxed)
}

fn put_ipv4_header(
    buf: &mut BytesMut,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    ident: u16,
    protocol: u8,
    total_len: u16,
) {
    buf.put_u8(0x45); // version 4, IHL 5
    buf.put_u8(0);
    buf.put_u16(total_len);
    buf.put_u16(ident);
    buf.put_u16(DONT_FRAGMENT);
    buf.put_u8(TTL);
    buf.put_u8(protocol);
    buf.put_u16(0); // checksum patched below
    buf.put_slice(&src.ip().octets());
    buf.put_slice(&dst.ip().octets());

    let sum = checksum::ipv4_header(&buf[..20]);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());
}

/// Synthesize a complete IPv4/TCP packet for the return direction.
pub fn build_tcp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    ident: u16,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Bytes {
    let total_len = 20 + 20 + payload.len();
    let mut buf = BytesMut::with_capacity(total_len);
    put_ipv4_header(&mut buf, src, dst, ident, IPPROTO_TCP, total_len as u16);

    buf.put_u16(src.port());
    buf.put_u16(dst.port());
    buf.put_u32(seq);
    buf.put_u32(ack);
    buf.put_u8(5 << 4); // data offset 5 words, no options
    buf.put_u8(flags.0);
    buf.put_u16(WINDOW);
    buf.put_u16(0); // checksum patched below
    buf.put_u16(0); // urgent pointer
    buf.put_slice(payload);

    let sum = checksum::l4(*src.ip(), *dst.ip(), IPPROTO_TCP, &buf[20..]);
    buf[36..38].copy_from_slice(&sum.to_be_bytes());
    buf.freeze()
}

/// Synthesize a complete IPv4/UDP packet for the return direction.
pub fn build_udp(src: SocketAddrV4, dst: SocketAddrV4, ident: u16, payload: &[u8]) -> Bytes {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut buf = BytesMut::with_capacity(total_len);
    put_ipv4_header(&mut buf, src, dst, ident, IPPROTO_UDP, total_len as u16);

    buf.put_u16(src.port());
    buf.put_u16(dst.port());
    buf.put_u16(udp_len as u16);
    buf.put_u16(0); // checksum patched below
    buf.put_slice(payload);

    let sum = checksum::l4(*src.ip(), *dst.ip(), IPPROTO_UDP, &buf[20..]);
    buf[26..28].copy_from_slice(&sum.to_be_bytes());
    buf.freeze()
}
