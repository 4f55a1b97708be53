//! IPv4/TCP/UDP header parsing and reply-packet synthesis.
//!
//! Pure byte-level codecs: no I/O, no allocation beyond the buffers the
//! builders return. Malformed input yields `Error::Malformed`; callers drop
//! the packet and log at trace level.

pub mod build;
pub mod checksum;
pub mod ipv4;
pub mod tcp;
pub mod udp;

pub use build::{build_tcp, build_udp, next_ident};
pub use ipv4::{Ipv4Header, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
pub use tcp::{seq_less_than, TcpFlags, TcpSegment};
pub use udp::UdpHeader;
