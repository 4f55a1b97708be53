//! The tunnel read loop: one IPv4 datagram per iteration, dispatched by
//! protocol to the TCP or UDP proxy. Owns the eviction tick and the
//! shutdown sequence.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::packet::{checksum, Ipv4Header, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use crate::proxy::{TcpProxy, UdpProxy};
use crate::stats::StatsSnapshot;
use crate::table::{ConnectionTable, FlowInfo};
use crate::tun::{spawn_writer, TunDevice};

pub struct Router {
    config: Arc<Config>,
    table: Arc<ConnectionTable>,
    device: Arc<dyn TunDevice>,
    cancel: CancellationToken,
}

impl Router {
    pub fn new(config: Config, device: Arc<dyn TunDevice>) -> Self {
        Self {
            config: Arc::new(config),
            table: Arc::new(ConnectionTable::new()),
            device,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the read loop and triggers full teardown.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.table.snapshot()
    }

    /// Live-flow listing for introspection surfaces.
    pub async fn list_flows(&self) -> Vec<FlowInfo> {
        self.table.list(Instant::now()).await
    }

    /// Drive the tunnel until cancellation or a failed tunnel read. On the
    /// way out: stop dispatching, close every flow, then stop the tunnel
    /// writer.
    pub async fn run(&self) -> Result<()> {
        let writer_cancel = CancellationToken::new();
        let (sink, writer_handle) = spawn_writer(self.device.clone(), writer_cancel.clone());

        let tcp = Arc::new(TcpProxy::new(
            self.config.clone(),
            self.table.clone(),
            sink.clone(),
        ));
        let udp = Arc::new(UdpProxy::new(
            self.config.clone(),
            self.table.clone(),
            sink,
        ));
        let evictor = self.spawn_eviction_tick(self.cancel.child_token());

        info!(
            socks = %self.config.socks,
            mtu = self.config.tunnel_mtu,
            "router started"
        );

        let mut buf = vec![0u8; self.config.tunnel_mtu];
        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("router cancellation received");
                    break Ok(());
                }
                read = self.device.read_packet(&mut buf) => match read {
                    Ok(0) => continue,
                    Ok(n) => self.dispatch(&tcp, &udp, &buf[..n]).await,
                    Err(err) => {
                        error!(error = %err, "tunnel read failed, shutting down");
                        break Err(err);
                    }
                }
            }
        };

        self.cancel.cancel();
        let _ = evictor.await;
        let closed = self.table.close_all().await;
        writer_cancel.cancel();
        let _ = writer_handle.await;
        info!(closed_flows = closed, "router stopped");

        result
    }

    async fn dispatch(&self, tcp: &Arc<TcpProxy>, udp: &Arc<UdpProxy>, packet: &[u8]) {
        let ip = match Ipv4Header::parse(packet) {
            Ok(ip) => ip,
            Err(err) => {
                trace!(error = %err, len = packet.len(), "dropping unparseable datagram");
                return;
            }
        };
        if self.config.verify_ipv4_checksum
            && !checksum::ipv4_header_valid(&packet[..ip.header_len])
        {
            trace!(src = %ip.src, dst = %ip.dst, "dropping datagram with bad header checksum");
            return;
        }
        let l4 = ip.payload(packet);

        match ip.protocol {
            IPPROTO_TCP => tcp.handle_packet(&ip, l4).await,
            IPPROTO_UDP => udp.handle_packet(&ip, l4).await,
            IPPROTO_ICMP => trace!(src = %ip.src, dst = %ip.dst, "icmp dropped"),
            other => trace!(protocol = other, "unsupported protocol dropped"),
        }
    }

    fn spawn_eviction_tick(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let table = self.table.clone();
        let tick = self.config.eviction_tick();
        let idle = self.config.idle_timeout();
        let time_wait = self.config.time_wait_timeout();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            // the immediate first tick is useless work
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = table.evict(Instant::now(), idle, time_wait).await;
                        for (kind, key, reason) in &removed {
                            debug!(kind = %kind, flow = %key, reason = %reason, "connection closed: evicted");
                        }
                        if !removed.is_empty() {
                            debug!(removed = removed.len(), "eviction tick");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
