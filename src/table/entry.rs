use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// The 5-tuple every connection is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub transport: Transport,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            transport: Transport::Tcp,
            src,
            dst,
        }
    }

    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            transport: Transport::Udp,
            src,
            dst,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}→{}", self.transport, self.src, self.dst)
    }
}

/// Which sub-map a flow lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Tcp,
    Udp,
    UdpAssociate,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::Tcp => write!(f, "tcp"),
            FlowKind::Udp => write!(f, "udp"),
            FlowKind::UdpAssociate => write!(f, "udp-associate"),
        }
    }
}

/// Tunnel-side TCP machine states. `Closed` is represented by absence from
/// the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

/// Wrapping 32-bit sequence accounting for one connection.
///
/// `our_seq` is the next sequence we will send toward the tunnel — the ISS
/// itself is consumed by the SYN-ACK, so it starts at ISS + 1. `peer_seq` is
/// the next byte expected from the peer (their ISS + 1 right after the SYN).
/// `our_initial_ack` pins the ack carried on the SYN-ACK.
#[derive(Debug, Clone, Copy)]
pub struct SeqTracker {
    pub our_seq: u32,
    pub peer_seq: u32,
    pub our_initial_ack: u32,
}

impl SeqTracker {
    pub fn new(our_isn: u32, peer_isn: u32) -> Self {
        let peer_seq = peer_isn.wrapping_add(1);
        Self {
            our_seq: our_isn.wrapping_add(1),
            peer_seq,
            our_initial_ack: peer_seq,
        }
    }
}

/// Timestamps and byte counters shared by every entry kind. Reader tasks and
/// the table updater mutate it; eviction only reads.
#[derive(Debug)]
pub struct Activity {
    created_at: Instant,
    last_activity: StdMutex<Instant>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Activity {
    pub fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            last_activity: StdMutex::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the flow was installed, saturating to zero.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn touch(&self, now: Instant) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if now > *last {
            *last = now;
        }
    }

    /// Time since the last recorded activity, saturating to zero.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        now.saturating_duration_since(last)
    }

    pub fn add(&self, sent: u64, received: u64) {
        if sent > 0 {
            self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        }
        if received > 0 {
            self.bytes_received.fetch_add(received, Ordering::Relaxed);
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// A proxied TCP connection: upstream CONNECT write half, machine state,
/// sequence tracker, reader-task token. The read half lives inside the
/// reader task itself.
#[derive(Clone)]
pub struct TcpEntry {
    pub write_half: Arc<Mutex<OwnedWriteHalf>>,
    state: Arc<StdMutex<TcpState>>,
    seq: Arc<StdMutex<SeqTracker>>,
    pub cancel: CancellationToken,
    pub activity: Arc<Activity>,
}

impl TcpEntry {
    pub fn new(
        write_half: OwnedWriteHalf,
        seq: SeqTracker,
        cancel: CancellationToken,
        now: Instant,
    ) -> Self {
        Self {
            write_half: Arc::new(Mutex::new(write_half)),
            state: Arc::new(StdMutex::new(TcpState::SynSent)),
            seq: Arc::new(StdMutex::new(seq)),
            cancel,
            activity: Arc::new(Activity::new(now)),
        }
    }

    pub fn state(&self) -> TcpState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: TcpState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Run `f` with the sequence tracker held. Keep the closure free of
    /// await points; the lock is a plain mutex.
    pub fn with_seq<R>(&self, f: impl FnOnce(&mut SeqTracker) -> R) -> R {
        let mut seq = self.seq.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut seq)
    }
}

/// A UDP ASSOCIATE relay: the control stream keeps the association alive on
/// the server; dropping the entry tears both sockets down (control first).
#[derive(Clone)]
pub struct UdpAssociateEntry {
    _control: Arc<TcpStream>,
    pub relay: Arc<UdpSocket>,
    pub relay_endpoint: SocketAddr,
    pub cancel: CancellationToken,
    pub activity: Arc<Activity>,
}

impl UdpAssociateEntry {
    pub fn new(
        control: TcpStream,
        relay: UdpSocket,
        relay_endpoint: SocketAddr,
        cancel: CancellationToken,
        now: Instant,
    ) -> Self {
        Self {
            _control: Arc::new(control),
            relay: Arc::new(relay),
            relay_endpoint,
            cancel,
            activity: Arc::new(Activity::new(now)),
        }
    }
}

/// A DNS fast-path flow: one entry per 5-tuple counting in-flight
/// DNS-over-TCP exchanges. The entry leaves the table when the last
/// exchange finishes.
#[derive(Clone)]
pub struct UdpFlowEntry {
    pub cancel: CancellationToken,
    pub inflight: Arc<AtomicUsize>,
    pub activity: Arc<Activity>,
}

impl UdpFlowEntry {
    pub fn new(cancel: CancellationToken, now: Instant) -> Self {
        Self {
            cancel,
            inflight: Arc::new(AtomicUsize::new(0)),
            activity: Arc::new(Activity::new(now)),
        }
    }
}
