//! tunsocks: a userspace packet router bridging a layer-3 tunnel interface
//! to an upstream SOCKS5 proxy.
//!
//! IP datagrams read from the tunnel are demultiplexed per 5-tuple; TCP
//! payloads ride SOCKS5 CONNECT streams, UDP payloads ride UDP ASSOCIATE
//! relays (with a DNS-over-TCP fast path for port 53), and responses are
//! re-encapsulated into synthetic datagrams written back to the tunnel.

pub mod common;
pub mod config;
pub mod packet;
pub mod proxy;
pub mod router;
pub mod socks;
pub mod stats;
pub mod table;
pub mod tun;

pub use config::Config;
pub use router::Router;
pub use stats::StatsSnapshot;
