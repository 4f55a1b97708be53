//! Client-side SOCKS5 framing: CONNECT / UDP ASSOCIATE handshakes (RFC 1928,
//! no-auth only) and the UDP relay wrapper.

pub mod handshake;
pub mod udp;

pub use handshake::{establish_connect, establish_udp_associate};
