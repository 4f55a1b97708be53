use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::packet::{build_udp, next_ident, Ipv4Header, UdpHeader};
use crate::proxy::dns::DnsFastPath;
use crate::socks;
use crate::table::{ConnectionTable, FlowKey, FlowKind, UdpAssociateEntry};
use crate::tun::PacketSink;

pub const DNS_PORT: u16 = 53;

/// Largest datagram a relay read may carry.
const MAX_DATAGRAM: usize = 65535;

/// Carries tunnel-side UDP flows over SOCKS5 UDP ASSOCIATE relays, one
/// association per 5-tuple. Port-53 traffic takes the DNS-over-TCP fast
/// path instead.
pub struct UdpProxy {
    config: Arc<Config>,
    table: Arc<ConnectionTable>,
    sink: PacketSink,
    dns: Arc<DnsFastPath>,
    /// Keys whose ASSOCIATE handshake is still in flight; datagrams racing
    /// the setup are dropped, which UDP senders tolerate.
    pending: StdMutex<HashSet<FlowKey>>,
}

impl UdpProxy {
    pub fn new(config: Arc<Config>, table: Arc<ConnectionTable>, sink: PacketSink) -> Self {
        let dns = Arc::new(DnsFastPath::new(
            config.clone(),
            table.clone(),
            sink.clone(),
        ));
        Self {
            config,
            table,
            sink,
            dns,
            pending: StdMutex::new(HashSet::new()),
        }
    }

    /// Entry point from the router for one UDP datagram off the tunnel.
    pub async fn handle_packet(self: &Arc<Self>, ip: &Ipv4Header, l4: &[u8]) {
        let header = match UdpHeader::parse(l4) {
            Ok(header) => header,
            Err(err) => {
                trace!(error = %err, "dropping malformed UDP datagram");
                return;
            }
        };

        let src = SocketAddrV4::new(ip.src, header.src_port);
        let dst = SocketAddrV4::new(ip.dst, header.dst_port);
        let key = FlowKey::udp(SocketAddr::V4(src), SocketAddr::V4(dst));
        let payload = header.payload(l4);

        if header.dst_port == DNS_PORT {
            self.dns.handle_query(key, src, dst, payload).await;
            return;
        }

        if let Some(entry) = self.table.get_associate(&key).await {
            self.relay_out(&entry, key, SocketAddr::V4(dst), payload)
                .await;
            return;
        }

        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if !pending.insert(key) {
                trace!(flow = %key, "datagram while associate in flight dropped");
                return;
            }
        }

        let proxy = Arc::clone(self);
        let first_payload = payload.to_vec();
        tokio::spawn(async move {
            proxy.establish(key, src, dst, first_payload).await;
            proxy
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        });
    }

    // ── association lifecycle ──

    async fn establish(self: &Arc<Self>, key: FlowKey, src: SocketAddrV4, dst: SocketAddrV4, first_payload: Vec<u8>) {
        let (control, relay, relay_endpoint) = match self.open_relay().await {
            Ok(parts) => parts,
            Err(err) => {
                warn!(flow = %key, error = %err, "udp associate failed, datagram dropped");
                return;
            }
        };

        let cancel = CancellationToken::new();
        let entry = UdpAssociateEntry::new(control, relay, relay_endpoint, cancel.clone(), Instant::now());
        if !self.table.insert_associate(key, entry.clone()).await {
            trace!(flow = %key, "lost associate install race");
            return;
        }
        debug!(flow = %key, relay = %relay_endpoint, "udp associate established");

        self.spawn_reader(key, src, entry.relay.clone(), cancel);
        self.relay_out(&entry, key, SocketAddr::V4(dst), &first_payload)
            .await;
    }

    /// Greeting + ASSOCIATE on a fresh control stream, then a local datagram
    /// socket fixed on the advertised relay endpoint. Any failure drops both
    /// sockets on the way out.
    async fn open_relay(&self) -> crate::common::Result<(TcpStream, UdpSocket, SocketAddr)> {
        let endpoint = &self.config.socks;
        let mut control = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        let server_ip = control.peer_addr()?.ip();

        let relay_endpoint = socks::establish_udp_associate(
            &mut control,
            server_ip,
            self.config.handshake_timeout(),
        )
        .await?;

        let local_bind: SocketAddr = if relay_endpoint.is_ipv4() {
            "0.0.0.0:0".parse().expect("static addr")
        } else {
            "[::]:0".parse().expect("static addr")
        };
        let relay = UdpSocket::bind(local_bind).await?;
        // Fix the remote so reads only ever yield relay traffic.
        relay.connect(relay_endpoint).await?;

        Ok((control, relay, relay_endpoint))
    }

    /// Wrap and forward one datagram toward the relay.
    async fn relay_out(&self, entry: &UdpAssociateEntry, key: FlowKey, dst: SocketAddr, payload: &[u8]) {
        let wrapped = socks::udp::encap(dst, payload);
        match entry.relay.send(&wrapped).await {
            Ok(_) => {
                self.table
                    .update_stats(FlowKind::UdpAssociate, &key, payload.len() as u64, 0)
                    .await;
            }
            Err(err) => {
                // Mid-flow failure closes the flow silently.
                debug!(flow = %key, error = %err, "relay send failed");
                if let Some(entry) = self.table.remove_associate(&key).await {
                    entry.cancel.cancel();
                    debug!(flow = %key, "connection closed: relay failure");
                }
            }
        }
    }

    // ── relay → tunnel ──

    fn spawn_reader(
        self: &Arc<Self>,
        key: FlowKey,
        flow_src: SocketAddrV4,
        relay: Arc<UdpSocket>,
        cancel: CancellationToken,
    ) {
        let proxy = Arc::clone(self);

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!(flow = %key, "relay reader cancelled");
                        return;
                    }
                    result = relay.recv(&mut buf) => match result {
                        Ok(n) => proxy.relay_in(key, flow_src, &buf[..n]).await,
                        Err(err) => {
                            // The next eviction tick reaps the entry.
                            debug!(flow = %key, error = %err, "relay read failed");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Decapsulate one relayed datagram and synthesize it toward the
    /// original flow source.
    async fn relay_in(&self, key: FlowKey, flow_src: SocketAddrV4, datagram: &[u8]) {
        let Some((inner_src, payload)) = socks::udp::decap(datagram) else {
            trace!(flow = %key, len = datagram.len(), "invalid socks5 udp wrapper dropped");
            return;
        };
        // The tunnel ingress is IPv4-only; an IPv6 inner source cannot be
        // synthesized back onto this flow.
        let IpAddr::V4(inner_ip) = inner_src.ip() else {
            trace!(flow = %key, "ipv6 inner source on ipv4 flow dropped");
            return;
        };

        let packet = build_udp(
            SocketAddrV4::new(inner_ip, inner_src.port()),
            flow_src,
            next_ident(),
            payload,
        );
        self.sink.send(packet).await;
        self.table
            .update_stats(FlowKind::UdpAssociate, &key, 0, payload.len() as u64)
            .await;
    }
}
