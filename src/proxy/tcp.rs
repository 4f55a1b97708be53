use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::common::{Address, Result};
use crate::config::Config;
use crate::packet::{build_tcp, next_ident, seq_less_than, Ipv4Header, TcpFlags, TcpSegment};
use crate::table::{ConnectionTable, FlowKey, FlowKind, SeqTracker, TcpEntry, TcpState};
use crate::tun::PacketSink;

/// Bridges tunnel-side TCP connections onto SOCKS5 CONNECT streams.
///
/// The tunnel side is a miniature TCP endpoint: the proxy answers the peer's
/// SYN itself, acknowledges payload after it is committed to the upstream
/// socket, and closes with synthesized FIN/RST segments. No retransmission,
/// reassembly, or window management — segments out of order are dropped and
/// re-asked via a pure ACK, and the peer kernel retransmits.
pub struct TcpProxy {
    config: Arc<Config>,
    table: Arc<ConnectionTable>,
    sink: PacketSink,
    /// Keys whose SOCKS5 handshake is still in flight. Consulted together
    /// with the table so SYN retransmits never open a second upstream.
    pending: StdMutex<HashSet<FlowKey>>,
}

impl TcpProxy {
    pub fn new(config: Arc<Config>, table: Arc<ConnectionTable>, sink: PacketSink) -> Self {
        Self {
            config,
            table,
            sink,
            pending: StdMutex::new(HashSet::new()),
        }
    }

    /// Entry point from the router for one TCP segment off the tunnel.
    pub async fn handle_packet(self: &Arc<Self>, ip: &Ipv4Header, l4: &[u8]) {
        let segment = match TcpSegment::parse(l4) {
            Ok(segment) => segment,
            Err(err) => {
                trace!(error = %err, "dropping malformed TCP segment");
                return;
            }
        };

        let src = SocketAddrV4::new(ip.src, segment.src_port);
        let dst = SocketAddrV4::new(ip.dst, segment.dst_port);
        let key = FlowKey::tcp(SocketAddr::V4(src), SocketAddr::V4(dst));
        let payload = segment.payload(l4);

        if segment.flags.rst() {
            self.handle_rst(key).await;
            return;
        }
        if segment.flags.syn() && !segment.flags.ack() {
            self.handle_syn(key, src, dst, segment.seq).await;
            return;
        }

        let Some(entry) = self.table.get_tcp(&key).await else {
            trace!(flow = %key, flags = %segment.flags, "segment for unknown flow dropped");
            return;
        };
        self.handle_segment(&entry, key, src, dst, &segment, payload)
            .await;
    }

    // ── connection establishment ──

    async fn handle_syn(self: &Arc<Self>, key: FlowKey, src: SocketAddrV4, dst: SocketAddrV4, peer_isn: u32) {
        if self.table.get_tcp(&key).await.is_some() {
            trace!(flow = %key, "SYN for live flow dropped");
            return;
        }
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if !pending.insert(key) {
                trace!(flow = %key, "SYN while handshake in flight dropped");
                return;
            }
        }

        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            proxy.establish(key, src, dst, peer_isn).await;
            proxy
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        });
    }

    async fn establish(self: &Arc<Self>, key: FlowKey, src: SocketAddrV4, dst: SocketAddrV4, peer_isn: u32) {
        let stream = match self.connect_upstream(SocketAddr::V4(dst)).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(flow = %key, error = %err, "socks5 connect failed");
                // refuse the connection; nothing was installed
                let rst = build_tcp(
                    dst,
                    src,
                    next_ident(),
                    TcpFlags::RST,
                    0,
                    peer_isn.wrapping_add(1),
                    &[],
                );
                self.sink.send(rst).await;
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let isn: u32 = rand::random();
        let cancel = CancellationToken::new();
        let entry = TcpEntry::new(
            write_half,
            SeqTracker::new(isn, peer_isn),
            cancel.clone(),
            Instant::now(),
        );

        if !self.table.insert_tcp(key, entry.clone()).await {
            trace!(flow = %key, "lost install race, dropping upstream");
            cancel.cancel();
            return;
        }
        debug!(flow = %key, "tcp flow established through socks5");

        let syn_ack = build_tcp(
            dst,
            src,
            next_ident(),
            TcpFlags::SYN | TcpFlags::ACK,
            isn,
            entry.with_seq(|seq| seq.our_initial_ack),
            &[],
        );
        self.sink.send(syn_ack).await;

        self.spawn_reader(key, src, dst, read_half, cancel);
    }

    async fn connect_upstream(&self, dst: SocketAddr) -> Result<TcpStream> {
        let endpoint = &self.config.socks;
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        crate::socks::establish_connect(
            &mut stream,
            &Address::Ip(dst),
            self.config.handshake_timeout(),
        )
        .await?;
        Ok(stream)
    }

    // ── segments on a live flow ──

    async fn handle_segment(
        self: &Arc<Self>,
        entry: &TcpEntry,
        key: FlowKey,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        segment: &TcpSegment,
        payload: &[u8],
    ) {
        // A peer ACK (or anything carrying one) completes the handshake.
        if entry.state() == TcpState::SynSent && segment.flags.ack() {
            entry.set_state(TcpState::Established);
            self.table.update_stats(FlowKind::Tcp, &key, 0, 0).await;
            trace!(flow = %key, "handshake acknowledged");
        }

        if !payload.is_empty() {
            let delivered = self
                .deliver_payload(entry, key, src, dst, segment, payload)
                .await;
            if !delivered {
                // out-of-order or undeliverable; any FIN rides the retransmit
                return;
            }
        }

        if segment.flags.fin() {
            self.handle_fin(entry, key, src, dst).await;
            return;
        }

        if payload.is_empty() && segment.flags.ack() {
            self.handle_pure_ack(entry, key, segment.ack).await;
        }
    }

    /// Write in-order payload upstream and acknowledge it. Returns false if
    /// the segment was dropped (wrong state, out of order, or write failure).
    async fn deliver_payload(
        self: &Arc<Self>,
        entry: &TcpEntry,
        key: FlowKey,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        segment: &TcpSegment,
        payload: &[u8],
    ) -> bool {
        if entry.state() != TcpState::Established {
            trace!(flow = %key, state = ?entry.state(), "payload outside ESTABLISHED dropped");
            return false;
        }

        let expected = entry.with_seq(|seq| seq.peer_seq);
        if segment.seq != expected {
            // No reassembly: re-assert the expected sequence so the peer
            // retransmits from there.
            let kind = if seq_less_than(segment.seq, expected) {
                "stale retransmission"
            } else {
                "future segment"
            };
            trace!(flow = %key, seq = segment.seq, expected, "{kind} dropped");
            let (our_seq, peer_seq) = entry.with_seq(|seq| (seq.our_seq, seq.peer_seq));
            let ack = build_tcp(dst, src, next_ident(), TcpFlags::ACK, our_seq, peer_seq, &[]);
            self.sink.send(ack).await;
            return false;
        }

        let write_result = {
            let mut writer = entry.write_half.lock().await;
            writer.write_all(payload).await
        };
        if let Err(err) = write_result {
            debug!(flow = %key, error = %err, "upstream write failed");
            self.abort(key, src, dst, true).await;
            return false;
        }

        let (our_seq, peer_seq) = entry.with_seq(|seq| {
            seq.peer_seq = seq.peer_seq.wrapping_add(payload.len() as u32);
            (seq.our_seq, seq.peer_seq)
        });
        let ack = build_tcp(dst, src, next_ident(), TcpFlags::ACK, our_seq, peer_seq, &[]);
        self.sink.send(ack).await;
        self.table
            .update_stats(FlowKind::Tcp, &key, payload.len() as u64, 0)
            .await;
        true
    }

    /// Peer closes. The FIN is acknowledged, the upstream write half shut
    /// down, and our own FIN answered in the same breath; the final peer ACK
    /// moves the flow into TIME_WAIT where eviction reaps it.
    async fn handle_fin(
        self: &Arc<Self>,
        entry: &TcpEntry,
        key: FlowKey,
        src: SocketAddrV4,
        dst: SocketAddrV4,
    ) {
        let state = entry.state();
        // A FIN retransmitted after we already counted it must not advance
        // the expected sequence again.
        let first_fin = !matches!(state, TcpState::Closing | TcpState::TimeWait);
        let (our_seq, peer_seq) = entry.with_seq(|seq| {
            if first_fin {
                seq.peer_seq = seq.peer_seq.wrapping_add(1);
            }
            (seq.our_seq, seq.peer_seq)
        });
        let ack = build_tcp(dst, src, next_ident(), TcpFlags::ACK, our_seq, peer_seq, &[]);
        self.sink.send(ack).await;

        match state {
            TcpState::SynSent | TcpState::Established => {
                {
                    let mut writer = entry.write_half.lock().await;
                    let _ = writer.shutdown().await;
                }
                let (fin_seq, peer_seq) = entry.with_seq(|seq| {
                    let fin_seq = seq.our_seq;
                    seq.our_seq = seq.our_seq.wrapping_add(1);
                    (fin_seq, seq.peer_seq)
                });
                let fin = build_tcp(
                    dst,
                    src,
                    next_ident(),
                    TcpFlags::FIN | TcpFlags::ACK,
                    fin_seq,
                    peer_seq,
                    &[],
                );
                self.sink.send(fin).await;
                entry.set_state(TcpState::Closing);
                debug!(flow = %key, "peer closed, fin exchanged");
            }
            TcpState::FinWait1 => {
                // simultaneous close
                entry.set_state(TcpState::Closing);
            }
            TcpState::FinWait2 => {
                entry.set_state(TcpState::TimeWait);
                debug!(flow = %key, "flow entered time-wait");
            }
            TcpState::Closing | TcpState::TimeWait => {}
        }
        self.table.update_stats(FlowKind::Tcp, &key, 0, 0).await;
    }

    async fn handle_pure_ack(&self, entry: &TcpEntry, key: FlowKey, ack: u32) {
        let our_seq = entry.with_seq(|seq| seq.our_seq);
        match entry.state() {
            TcpState::FinWait1 if ack == our_seq => {
                entry.set_state(TcpState::FinWait2);
            }
            TcpState::Closing if ack == our_seq => {
                entry.set_state(TcpState::TimeWait);
                debug!(flow = %key, "flow entered time-wait");
            }
            _ => {}
        }
        self.table.update_stats(FlowKind::Tcp, &key, 0, 0).await;
    }

    /// Peer reset: immediate teardown, no reply.
    async fn handle_rst(&self, key: FlowKey) {
        if let Some(entry) = self.table.remove_tcp(&key).await {
            entry.cancel.cancel();
            debug!(flow = %key, "connection closed: peer reset");
        }
    }

    /// Terminal upstream failure: drop the flow and, when asked, tell the
    /// peer with a RST.
    async fn abort(&self, key: FlowKey, src: SocketAddrV4, dst: SocketAddrV4, send_rst: bool) {
        let Some(entry) = self.table.remove_tcp(&key).await else {
            return;
        };
        entry.cancel.cancel();
        if send_rst {
            let (our_seq, peer_seq) = entry.with_seq(|seq| (seq.our_seq, seq.peer_seq));
            let rst = build_tcp(dst, src, next_ident(), TcpFlags::RST, our_seq, peer_seq, &[]);
            self.sink.send(rst).await;
        }
        debug!(flow = %key, "connection closed: upstream failure");
    }

    // ── upstream → tunnel ──

    fn spawn_reader(
        self: &Arc<Self>,
        key: FlowKey,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        mut upstream: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let proxy = Arc::clone(self);
        // Chunks must fit the tunnel MTU once 40 bytes of synthesized
        // headers are added.
        let chunk = proxy.config.tunnel_mtu.saturating_sub(40).max(536);

        tokio::spawn(async move {
            let mut buf = vec![0u8; chunk];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!(flow = %key, "reader cancelled");
                        return;
                    }
                    result = upstream.read(&mut buf) => match result {
                        Ok(0) => {
                            proxy.upstream_eof(key, src, dst).await;
                            return;
                        }
                        Ok(n) => {
                            if !proxy.relay_chunk(key, src, dst, &buf[..n]).await {
                                return;
                            }
                        }
                        Err(err) => {
                            debug!(flow = %key, error = %err, "upstream read failed");
                            proxy.abort(key, src, dst, true).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Turn one upstream chunk into a PSH|ACK segment. Returns false when
    /// the flow is gone or closing toward the peer.
    async fn relay_chunk(&self, key: FlowKey, src: SocketAddrV4, dst: SocketAddrV4, chunk: &[u8]) -> bool {
        let Some(entry) = self.table.get_tcp(&key).await else {
            return false;
        };
        match entry.state() {
            TcpState::SynSent | TcpState::Established => {}
            state => {
                trace!(flow = %key, ?state, "upstream data after local close dropped");
                return false;
            }
        }

        let (seq, ack) = entry.with_seq(|tracker| {
            let pair = (tracker.our_seq, tracker.peer_seq);
            tracker.our_seq = tracker.our_seq.wrapping_add(chunk.len() as u32);
            pair
        });
        let packet = build_tcp(
            dst,
            src,
            next_ident(),
            TcpFlags::PSH | TcpFlags::ACK,
            seq,
            ack,
            chunk,
        );
        self.sink.send(packet).await;
        self.table
            .update_stats(FlowKind::Tcp, &key, 0, chunk.len() as u64)
            .await;
        true
    }

    /// Upstream finished sending: close toward the peer with FIN|ACK.
    async fn upstream_eof(&self, key: FlowKey, src: SocketAddrV4, dst: SocketAddrV4) {
        let Some(entry) = self.table.get_tcp(&key).await else {
            return;
        };
        match entry.state() {
            TcpState::SynSent | TcpState::Established => {
                let (fin_seq, peer_seq) = entry.with_seq(|seq| {
                    let fin_seq = seq.our_seq;
                    seq.our_seq = seq.our_seq.wrapping_add(1);
                    (fin_seq, seq.peer_seq)
                });
                let fin = build_tcp(
                    dst,
                    src,
                    next_ident(),
                    TcpFlags::FIN | TcpFlags::ACK,
                    fin_seq,
                    peer_seq,
                    &[],
                );
                self.sink.send(fin).await;
                entry.set_state(TcpState::FinWait1);
                self.table.update_stats(FlowKind::Tcp, &key, 0, 0).await;
                debug!(flow = %key, "upstream eof, closing toward peer");
            }
            // Our FIN is already out (passive or simultaneous close).
            _ => {}
        }
    }
}
