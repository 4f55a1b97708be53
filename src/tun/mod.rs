//! The tunnel seam. The OS device itself is an external collaborator; the
//! core only consumes something that reads and writes one IP datagram per
//! call.

#[cfg(unix)]
mod fd;

#[cfg(unix)]
pub use fd::FdTun;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// A point-to-point layer-3 tunnel: each successful read yields exactly one
/// IP datagram, each write injects exactly one.
#[async_trait]
pub trait TunDevice: Send + Sync {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;
    async fn write_packet(&self, buf: &[u8]) -> Result<usize>;
}

/// Depth of the synthesized-packet queue feeding the tunnel writer.
const WRITER_QUEUE_DEPTH: usize = 512;

/// Cloneable handle through which proxies and reader tasks emit synthesized
/// datagrams. All tunnel writes funnel through one writer task, so a single
/// write always carries a single whole datagram.
#[derive(Clone)]
pub struct PacketSink {
    tx: mpsc::Sender<Bytes>,
}

impl PacketSink {
    /// Queue one datagram. A closed writer means shutdown is in progress;
    /// the packet is dropped silently.
    pub async fn send(&self, packet: Bytes) {
        if self.tx.send(packet).await.is_err() {
            trace!("tunnel writer gone, dropping packet");
        }
    }
}

/// Spawn the dedicated tunnel writer task. Write failures are logged and do
/// not stop the writer; if the tunnel has truly disappeared the router's own
/// read will fail and shut the system down.
pub fn spawn_writer(
    device: Arc<dyn TunDevice>,
    cancel: CancellationToken,
) -> (PacketSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITER_QUEUE_DEPTH);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                packet = rx.recv() => {
                    let Some(packet) = packet else { break };
                    if let Err(err) = device.write_packet(&packet).await {
                        warn!(error = %err, len = packet.len(), "tunnel write failed");
                    }
                }
            }
        }
    });

    (PacketSink { tx }, handle)
}
