use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::common::{Address, Error, Result};
use crate::config::Config;
use crate::packet::{build_udp, next_ident};
use crate::socks;
use crate::table::{ConnectionTable, FlowKey, FlowKind};
use crate::tun::PacketSink;

/// Carries tunnel UDP queries for port 53 as DNS-over-TCP through a
/// short-lived SOCKS5 CONNECT, instead of standing up a UDP relay per
/// resolver flow. One exchange: length-prefixed query out, one
/// length-prefixed response back, then the stream is dropped. Failures and
/// timeouts drop the reply silently, matching plain-UDP DNS behaviour.
pub struct DnsFastPath {
    config: Arc<Config>,
    table: Arc<ConnectionTable>,
    sink: PacketSink,
}

impl DnsFastPath {
    pub fn new(config: Arc<Config>, table: Arc<ConnectionTable>, sink: PacketSink) -> Self {
        Self {
            config,
            table,
            sink,
        }
    }

    pub async fn handle_query(
        self: &Arc<Self>,
        key: FlowKey,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        query: &[u8],
    ) {
        if query.is_empty() || query.len() > u16::MAX as usize {
            trace!(flow = %key, len = query.len(), "unframeable dns query dropped");
            return;
        }

        let (entry, is_new) = self.table.checkout_udp_flow(key, Instant::now()).await;
        if is_new {
            debug!(flow = %key, "dns flow opened");
        }
        self.table
            .update_stats(FlowKind::Udp, &key, query.len() as u64, 0)
            .await;

        let this = Arc::clone(self);
        let cancel = entry.cancel.clone();
        let query = query.to_vec();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!(flow = %key, "dns exchange cancelled");
                }
                result = this.exchange(SocketAddr::V4(dst), &query) => match result {
                    Ok(response) => {
                        this.table
                            .update_stats(FlowKind::Udp, &key, 0, response.len() as u64)
                            .await;
                        let reply = build_udp(dst, src, next_ident(), &response);
                        this.sink.send(reply).await;
                    }
                    Err(err) => {
                        debug!(flow = %key, error = %err, "dns exchange failed, reply dropped");
                    }
                }
            }
            this.table.finish_udp_flow(&key).await;
        });
    }

    /// CONNECT to the resolver through the proxy and run one DNS-over-TCP
    /// round trip (RFC 1035 §4.2.2 two-byte length framing).
    async fn exchange(&self, resolver: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
        let endpoint = &self.config.socks;
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        socks::establish_connect(
            &mut stream,
            &Address::Ip(resolver),
            self.config.handshake_timeout(),
        )
        .await?;

        let mut framed = Vec::with_capacity(2 + query.len());
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(query);
        stream.write_all(&framed).await?;

        let deadline = self.config.dns_timeout();
        let response = timeout(deadline, async {
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            if len == 0 {
                return Err(Error::Protocol("empty dns response".into()));
            }
            let mut response = vec![0u8; len];
            stream.read_exact(&mut response).await?;
            Ok(response)
        })
        .await
        .map_err(|_| Error::DnsTimeout(deadline))??;

        Ok(response)
    }
}
