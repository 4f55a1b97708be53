#![allow(dead_code)]
//! Shared harness: a channel-backed tun device plus byte-level packet
//! helpers for driving the router like an application stack would.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use tunsocks::packet::{build_tcp, build_udp, Ipv4Header, TcpFlags, TcpSegment, UdpHeader};
use tunsocks::tun::TunDevice;
use tunsocks::{Config, Router};

/// Tun device fed and observed through channels: tests inject datagrams and
/// read back whatever the core synthesizes.
pub struct ChannelTun {
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    written: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl TunDevice for ChannelTun {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let next = self.incoming.lock().await.recv().await;
        match next {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            // Injector gone: park instead of failing, the test drives
            // shutdown through the cancel token.
            None => futures_util::future::pending().await,
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        let _ = self.written.send(buf.to_vec());
        Ok(buf.len())
    }
}

pub struct TestRouter {
    pub router: Arc<Router>,
    inject_tx: mpsc::Sender<Vec<u8>>,
    written_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    runner: JoinHandle<Result<()>>,
}

impl TestRouter {
    pub async fn start(config: Config) -> Self {
        let (inject_tx, inject_rx) = mpsc::channel(64);
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let device = Arc::new(ChannelTun {
            incoming: Mutex::new(inject_rx),
            written: written_tx,
        });

        let router = Arc::new(Router::new(config, device));
        let runner = {
            let router = router.clone();
            tokio::spawn(async move { router.run().await })
        };

        Self {
            router,
            inject_tx,
            written_rx,
            runner,
        }
    }

    /// Push one datagram into the tunnel read path.
    pub async fn inject(&self, packet: Vec<u8>) {
        self.inject_tx.send(packet).await.expect("router gone");
    }

    /// Next synthesized datagram, or panic after two seconds.
    pub async fn expect_packet(&mut self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), self.written_rx.recv())
            .await
            .expect("timed out waiting for synthesized packet")
            .expect("tunnel writer closed")
    }

    /// Assert nothing reaches the tunnel within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(packet)) =
            tokio::time::timeout(window, self.written_rx.recv()).await
        {
            panic!("unexpected packet on tunnel: {packet:02x?}");
        }
    }

    pub async fn shutdown(self) {
        self.router.cancel_token().cancel();
        self.runner.await.expect("router task panicked").expect("router failed");
    }
}

// ── packet helpers (application side) ──

pub fn tcp_packet(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Vec<u8> {
    build_tcp(src, dst, 1, flags, seq, ack, payload).to_vec()
}

pub fn udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    build_udp(src, dst, 1, payload).to_vec()
}

#[derive(Debug)]
pub struct ParsedTcp {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
    pub payload: Vec<u8>,
}

pub fn parse_tcp(packet: &[u8]) -> ParsedTcp {
    assert!(
        tunsocks::packet::checksum::verify_packet(packet),
        "bad checksums on synthesized packet"
    );
    let ip = Ipv4Header::parse(packet).expect("bad IPv4 header");
    assert_eq!(ip.protocol, 6, "not a TCP packet");
    let l4 = ip.payload(packet);
    let segment = TcpSegment::parse(l4).expect("bad TCP header");
    ParsedTcp {
        src: SocketAddrV4::new(ip.src, segment.src_port),
        dst: SocketAddrV4::new(ip.dst, segment.dst_port),
        flags: segment.flags,
        seq: segment.seq,
        ack: segment.ack,
        payload: segment.payload(l4).to_vec(),
    }
}

#[derive(Debug)]
pub struct ParsedUdp {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub payload: Vec<u8>,
}

pub fn parse_udp(packet: &[u8]) -> ParsedUdp {
    assert!(
        tunsocks::packet::checksum::verify_packet(packet),
        "bad checksums on synthesized packet"
    );
    let ip = Ipv4Header::parse(packet).expect("bad IPv4 header");
    assert_eq!(ip.protocol, 17, "not a UDP packet");
    let l4 = ip.payload(packet);
    let header = UdpHeader::parse(l4).expect("bad UDP header");
    ParsedUdp {
        src: SocketAddrV4::new(ip.src, header.src_port),
        dst: SocketAddrV4::new(ip.dst, header.dst_port),
        payload: header.payload(l4).to_vec(),
    }
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
