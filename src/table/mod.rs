//! Concurrent registry of proxied flows, keyed by 5-tuple.
//!
//! Three sub-maps (TCP, UDP fast-path flows, UDP ASSOCIATE relays), each
//! behind its own lock. The table owns every entry; proxies and reader tasks
//! address entries by `FlowKey` only. Socket teardown always happens after
//! the relevant lock is released.

mod entry;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stats::{Stats, StatsSnapshot};

pub use entry::{
    Activity, FlowKey, FlowKind, SeqTracker, TcpEntry, TcpState, Transport, UdpAssociateEntry,
    UdpFlowEntry,
};

/// Why eviction removed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Idle,
    TimeWait,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictReason::Idle => write!(f, "idle"),
            EvictReason::TimeWait => write!(f, "time-wait"),
        }
    }
}

/// Point-in-time description of one live flow, for introspection surfaces
/// (the CLI's debug listing, embedders' UIs).
#[derive(Debug, Clone)]
pub struct FlowInfo {
    pub kind: FlowKind,
    pub key: FlowKey,
    /// Machine state for TCP flows, absent for the UDP kinds.
    pub tcp_state: Option<TcpState>,
    pub age: Duration,
    pub idle: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
pub struct ConnectionTable {
    tcp: Mutex<HashMap<FlowKey, TcpEntry>>,
    udp: Mutex<HashMap<FlowKey, UdpFlowEntry>>,
    associate: Mutex<HashMap<FlowKey, UdpAssociateEntry>>,
    stats: Stats,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    // ── TCP ──

    /// Install a TCP entry. Returns false (and drops nothing the caller
    /// still owns) when the key is already taken.
    pub async fn insert_tcp(&self, key: FlowKey, entry: TcpEntry) -> bool {
        let mut map = self.tcp.lock().await;
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, entry);
        drop(map);
        self.stats.flow_opened(FlowKind::Tcp);
        true
    }

    pub async fn get_tcp(&self, key: &FlowKey) -> Option<TcpEntry> {
        self.tcp.lock().await.get(key).cloned()
    }

    /// Remove and return a TCP entry so the caller can cancel its reader and
    /// close its socket outside the map lock.
    pub async fn remove_tcp(&self, key: &FlowKey) -> Option<TcpEntry> {
        let removed = self.tcp.lock().await.remove(key);
        if removed.is_some() {
            self.stats.flow_closed(FlowKind::Tcp);
        }
        removed
    }

    // ── UDP ASSOCIATE ──

    pub async fn insert_associate(&self, key: FlowKey, entry: UdpAssociateEntry) -> bool {
        let mut map = self.associate.lock().await;
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, entry);
        drop(map);
        self.stats.flow_opened(FlowKind::UdpAssociate);
        true
    }

    pub async fn get_associate(&self, key: &FlowKey) -> Option<UdpAssociateEntry> {
        self.associate.lock().await.get(key).cloned()
    }

    pub async fn remove_associate(&self, key: &FlowKey) -> Option<UdpAssociateEntry> {
        let removed = self.associate.lock().await.remove(key);
        if removed.is_some() {
            self.stats.flow_closed(FlowKind::UdpAssociate);
        }
        removed
    }

    // ── UDP fast-path flows ──

    /// Get or create the flow entry for a DNS exchange and count the
    /// exchange as in-flight. Returns the entry and whether it is new.
    pub async fn checkout_udp_flow(&self, key: FlowKey, now: Instant) -> (UdpFlowEntry, bool) {
        let mut map = self.udp.lock().await;
        if let Some(entry) = map.get(&key) {
            entry.inflight.fetch_add(1, Ordering::Relaxed);
            entry.activity.touch(now);
            return (entry.clone(), false);
        }
        let entry = UdpFlowEntry::new(CancellationToken::new(), now);
        entry.inflight.fetch_add(1, Ordering::Relaxed);
        map.insert(key, entry.clone());
        drop(map);
        self.stats.flow_opened(FlowKind::Udp);
        (entry, true)
    }

    /// Mark one in-flight exchange finished; the entry leaves the table with
    /// the last one.
    pub async fn finish_udp_flow(&self, key: &FlowKey) {
        let mut map = self.udp.lock().await;
        let remove = match map.get(key) {
            Some(entry) => entry.inflight.fetch_sub(1, Ordering::Relaxed) == 1,
            None => false,
        };
        if remove {
            map.remove(key);
            drop(map);
            self.stats.flow_closed(FlowKind::Udp);
        }
    }

    // ── Shared ──

    /// Add to a flow's byte counters and refresh its activity timestamp.
    /// Zero-valued updates still refresh the timestamp.
    pub async fn update_stats(&self, kind: FlowKind, key: &FlowKey, sent: u64, received: u64) {
        let now = Instant::now();
        let activity = match kind {
            FlowKind::Tcp => self.tcp.lock().await.get(key).map(|e| e.activity.clone()),
            FlowKind::Udp => self.udp.lock().await.get(key).map(|e| e.activity.clone()),
            FlowKind::UdpAssociate => self
                .associate
                .lock()
                .await
                .get(key)
                .map(|e| e.activity.clone()),
        };
        if let Some(activity) = activity {
            activity.add(sent, received);
            activity.touch(now);
            self.stats.add_traffic(sent, received);
        }
    }

    /// Walk each sub-map once and remove expired entries: TCP entries in
    /// `TimeWait` against the time-wait window, everything else against the
    /// idle window. Removed entries are cancelled and dropped after their
    /// lock is released; only `active_*` counters change. Idempotent for an
    /// unchanged `now`.
    pub async fn evict(
        &self,
        now: Instant,
        idle: Duration,
        time_wait: Duration,
    ) -> Vec<(FlowKind, FlowKey, EvictReason)> {
        let mut report = Vec::new();

        let mut expired_tcp = Vec::new();
        {
            let mut map = self.tcp.lock().await;
            let keys: Vec<(FlowKey, EvictReason)> = map
                .iter()
                .filter_map(|(key, entry)| {
                    let idle_for = entry.activity.idle_for(now);
                    if entry.state() == TcpState::TimeWait {
                        (idle_for > time_wait).then_some((*key, EvictReason::TimeWait))
                    } else {
                        (idle_for > idle).then_some((*key, EvictReason::Idle))
                    }
                })
                .collect();
            for (key, reason) in keys {
                if let Some(entry) = map.remove(&key) {
                    expired_tcp.push((key, reason, entry));
                }
            }
        }
        for (key, reason, entry) in expired_tcp {
            entry.cancel.cancel();
            self.stats.flow_closed(FlowKind::Tcp);
            report.push((FlowKind::Tcp, key, reason));
        }

        let mut expired_udp = Vec::new();
        {
            let mut map = self.udp.lock().await;
            let keys: Vec<FlowKey> = map
                .iter()
                .filter(|(_, entry)| entry.activity.idle_for(now) > idle)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                if let Some(entry) = map.remove(&key) {
                    expired_udp.push((key, entry));
                }
            }
        }
        for (key, entry) in expired_udp {
            entry.cancel.cancel();
            self.stats.flow_closed(FlowKind::Udp);
            report.push((FlowKind::Udp, key, EvictReason::Idle));
        }

        let mut expired_associate = Vec::new();
        {
            let mut map = self.associate.lock().await;
            let keys: Vec<FlowKey> = map
                .iter()
                .filter(|(_, entry)| entry.activity.idle_for(now) > idle)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                if let Some(entry) = map.remove(&key) {
                    expired_associate.push((key, entry));
                }
            }
        }
        for (key, entry) in expired_associate {
            entry.cancel.cancel();
            self.stats.flow_closed(FlowKind::UdpAssociate);
            report.push((FlowKind::UdpAssociate, key, EvictReason::Idle));
        }

        report
    }

    /// Cancel and drop every entry. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let tcp: Vec<_> = self.tcp.lock().await.drain().collect();
        let udp: Vec<_> = self.udp.lock().await.drain().collect();
        let associate: Vec<_> = self.associate.lock().await.drain().collect();
        let count = tcp.len() + udp.len() + associate.len();

        for (key, entry) in tcp {
            entry.cancel.cancel();
            self.stats.flow_closed(FlowKind::Tcp);
            debug!(flow = %key, "connection closed: shutdown");
        }
        for (key, entry) in udp {
            entry.cancel.cancel();
            self.stats.flow_closed(FlowKind::Udp);
            debug!(flow = %key, "connection closed: shutdown");
        }
        for (key, entry) in associate {
            entry.cancel.cancel();
            self.stats.flow_closed(FlowKind::UdpAssociate);
            debug!(flow = %key, "connection closed: shutdown");
        }

        count
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Describe every live flow. Sub-maps are walked one at a time; the
    /// result is a snapshot, not a consistent cut across kinds.
    pub async fn list(&self, now: Instant) -> Vec<FlowInfo> {
        let mut flows = Vec::new();

        for (key, entry) in self.tcp.lock().await.iter() {
            flows.push(FlowInfo {
                kind: FlowKind::Tcp,
                key: *key,
                tcp_state: Some(entry.state()),
                age: entry.activity.age(now),
                idle: entry.activity.idle_for(now),
                bytes_sent: entry.activity.bytes_sent(),
                bytes_received: entry.activity.bytes_received(),
            });
        }
        for (key, entry) in self.udp.lock().await.iter() {
            flows.push(FlowInfo {
                kind: FlowKind::Udp,
                key: *key,
                tcp_state: None,
                age: entry.activity.age(now),
                idle: entry.activity.idle_for(now),
                bytes_sent: entry.activity.bytes_sent(),
                bytes_received: entry.activity.bytes_received(),
            });
        }
        for (key, entry) in self.associate.lock().await.iter() {
            flows.push(FlowInfo {
                kind: FlowKind::UdpAssociate,
                key: *key,
                tcp_state: None,
                age: entry.activity.age(now),
                idle: entry.activity.idle_for(now),
                bytes_sent: entry.activity.bytes_sent(),
                bytes_received: entry.activity.bytes_received(),
            });
        }

        flows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream, UdpSocket};
    use tokio_util::sync::CancellationToken;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn tcp_entry(now: Instant) -> (TcpEntry, TcpStream) {
        let (client, server) = tcp_pair().await;
        let (_read, write) = client.into_split();
        let entry = TcpEntry::new(write, SeqTracker::new(1000, 1), CancellationToken::new(), now);
        (entry, server)
    }

    async fn associate_entry(now: Instant) -> (UdpAssociateEntry, TcpStream) {
        let (control, server) = tcp_pair().await;
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let entry = UdpAssociateEntry::new(
            control,
            relay,
            "127.0.0.1:4000".parse().unwrap(),
            CancellationToken::new(),
            now,
        );
        (entry, server)
    }

    fn key(port: u16) -> FlowKey {
        FlowKey::tcp(
            format!("10.0.0.2:{port}").parse().unwrap(),
            "1.1.1.1:80".parse().unwrap(),
        )
    }

    fn udp_key(port: u16) -> FlowKey {
        FlowKey::udp(
            format!("10.0.0.2:{port}").parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn insert_get_remove_tcp() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (entry, _peer) = tcp_entry(now).await;

        assert!(table.insert_tcp(key(1), entry).await);
        assert!(table.get_tcp(&key(1)).await.is_some());
        assert_eq!(table.snapshot().active_tcp, 1);
        assert_eq!(table.snapshot().total_tcp, 1);

        assert!(table.remove_tcp(&key(1)).await.is_some());
        assert!(table.get_tcp(&key(1)).await.is_none());
        assert_eq!(table.snapshot().active_tcp, 0);
        assert_eq!(table.snapshot().total_tcp, 1);
    }

    #[tokio::test]
    async fn duplicate_tcp_insert_fails() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (first, _peer1) = tcp_entry(now).await;
        let (second, _peer2) = tcp_entry(now).await;

        assert!(table.insert_tcp(key(1), first).await);
        assert!(!table.insert_tcp(key(1), second).await);
        assert_eq!(table.snapshot().total_tcp, 1);
    }

    #[tokio::test]
    async fn idle_eviction_removes_stale_entries() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (entry, _peer) = tcp_entry(now).await;
        entry.set_state(TcpState::Established);
        let cancel = entry.cancel.clone();
        table.insert_tcp(key(1), entry).await;

        let idle = Duration::from_secs(120);
        let tw = Duration::from_secs(30);

        // not yet idle long enough
        let removed = table.evict(now + Duration::from_secs(100), idle, tw).await;
        assert!(removed.is_empty());

        let removed = table.evict(now + Duration::from_secs(121), idle, tw).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, FlowKind::Tcp);
        assert_eq!(removed[0].2, EvictReason::Idle);
        assert!(cancel.is_cancelled());
        assert_eq!(table.snapshot().active_tcp, 0);
        assert_eq!(table.snapshot().total_tcp, 1);
    }

    #[tokio::test]
    async fn time_wait_uses_shorter_window() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (entry, _peer) = tcp_entry(now).await;
        entry.set_state(TcpState::TimeWait);
        table.insert_tcp(key(1), entry).await;

        let idle = Duration::from_secs(120);
        let tw = Duration::from_secs(30);

        // 40s idle: inside the idle window but past the time-wait window
        let removed = table.evict(now + Duration::from_secs(40), idle, tw).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].2, EvictReason::TimeWait);
        assert_eq!(table.snapshot().active_tcp, 0);
        assert_eq!(table.snapshot().total_tcp, 1);
    }

    #[tokio::test]
    async fn time_wait_survives_inside_window() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (entry, _peer) = tcp_entry(now).await;
        entry.set_state(TcpState::TimeWait);
        table.insert_tcp(key(1), entry).await;

        let removed = table
            .evict(
                now + Duration::from_secs(20),
                Duration::from_secs(120),
                Duration::from_secs(30),
            )
            .await;
        assert!(removed.is_empty());
        assert_eq!(table.snapshot().active_tcp, 1);
    }

    #[tokio::test]
    async fn eviction_is_idempotent_on_unchanged_clock() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (entry, _peer) = tcp_entry(now).await;
        entry.set_state(TcpState::Established);
        table.insert_tcp(key(1), entry).await;
        let (entry2, _peer2) = associate_entry(now).await;
        table.insert_associate(udp_key(2), entry2).await;

        let later = now + Duration::from_secs(200);
        let idle = Duration::from_secs(120);
        let tw = Duration::from_secs(30);

        let first = table.evict(later, idle, tw).await;
        assert_eq!(first.len(), 2);
        let second = table.evict(later, idle, tw).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn touch_defers_eviction() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (entry, _peer) = tcp_entry(now).await;
        entry.set_state(TcpState::Established);
        let activity = entry.activity.clone();
        table.insert_tcp(key(1), entry).await;

        activity.touch(now + Duration::from_secs(60));

        let removed = table
            .evict(
                now + Duration::from_secs(130),
                Duration::from_secs(120),
                Duration::from_secs(30),
            )
            .await;
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn update_stats_accumulates_and_refreshes() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (entry, _peer) = tcp_entry(now).await;
        let activity = entry.activity.clone();
        table.insert_tcp(key(1), entry).await;

        table.update_stats(FlowKind::Tcp, &key(1), 100, 0).await;
        table.update_stats(FlowKind::Tcp, &key(1), 0, 250).await;
        assert_eq!(activity.bytes_sent(), 100);
        assert_eq!(activity.bytes_received(), 250);
        let snap = table.snapshot();
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.bytes_received, 250);

        // zero-valued update still counts as activity
        table.update_stats(FlowKind::Tcp, &key(1), 0, 0).await;
        assert!(activity.idle_for(Instant::now()) < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn update_stats_ignores_missing_flows() {
        let table = ConnectionTable::new();
        table.update_stats(FlowKind::Tcp, &key(9), 100, 100).await;
        let snap = table.snapshot();
        assert_eq!(snap.bytes_sent, 0);
        assert_eq!(snap.bytes_received, 0);
    }

    #[tokio::test]
    async fn removing_one_flow_leaves_others_untouched() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (a, _peer_a) = tcp_entry(now).await;
        let (b, _peer_b) = tcp_entry(now).await;
        let b_activity = b.activity.clone();
        let b_cancel = b.cancel.clone();
        table.insert_tcp(key(1), a).await;
        table.insert_tcp(key(2), b).await;
        table.update_stats(FlowKind::Tcp, &key(2), 7, 9).await;

        table.remove_tcp(&key(1)).await.unwrap().cancel.cancel();

        let survivor = table.get_tcp(&key(2)).await.unwrap();
        assert!(!b_cancel.is_cancelled());
        assert_eq!(survivor.activity.bytes_sent(), 7);
        assert_eq!(b_activity.bytes_received(), 9);
        assert_eq!(table.snapshot().active_tcp, 1);
    }

    #[tokio::test]
    async fn udp_flow_checkout_and_finish() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let key = udp_key(53000);

        let (first, is_new) = table.checkout_udp_flow(key, now).await;
        assert!(is_new);
        let (_second, is_new) = table.checkout_udp_flow(key, now).await;
        assert!(!is_new);
        assert_eq!(first.inflight.load(Ordering::Relaxed), 2);
        assert_eq!(table.snapshot().total_udp, 1);
        assert_eq!(table.snapshot().active_udp, 1);

        table.finish_udp_flow(&key).await;
        assert_eq!(table.snapshot().active_udp, 1);
        table.finish_udp_flow(&key).await;
        assert_eq!(table.snapshot().active_udp, 0);
        assert_eq!(table.snapshot().total_udp, 1);
    }

    #[tokio::test]
    async fn list_describes_every_kind() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (tcp, _peer) = tcp_entry(now).await;
        tcp.set_state(TcpState::Established);
        table.insert_tcp(key(1), tcp).await;
        let (assoc, _peer2) = associate_entry(now).await;
        table.insert_associate(udp_key(2), assoc).await;
        table.checkout_udp_flow(udp_key(3), now).await;
        table.update_stats(FlowKind::Tcp, &key(1), 10, 20).await;

        let later = now + Duration::from_secs(5);
        let mut flows = table.list(later).await;
        assert_eq!(flows.len(), 3);
        flows.sort_by_key(|info| info.key.src.port());

        let tcp_info = &flows[0];
        assert_eq!(tcp_info.kind, FlowKind::Tcp);
        assert_eq!(tcp_info.tcp_state, Some(TcpState::Established));
        assert!(tcp_info.age >= Duration::from_secs(5));
        assert_eq!(tcp_info.bytes_sent, 10);
        assert_eq!(tcp_info.bytes_received, 20);

        assert_eq!(flows[1].kind, FlowKind::UdpAssociate);
        assert!(flows[1].tcp_state.is_none());
        assert_eq!(flows[2].kind, FlowKind::Udp);
    }

    #[tokio::test]
    async fn close_all_cancels_everything() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        let (tcp, _peer) = tcp_entry(now).await;
        let tcp_cancel = tcp.cancel.clone();
        let (assoc, _peer2) = associate_entry(now).await;
        let assoc_cancel = assoc.cancel.clone();
        table.insert_tcp(key(1), tcp).await;
        table.insert_associate(udp_key(2), assoc).await;
        let (flow, _) = table.checkout_udp_flow(udp_key(3), now).await;

        assert_eq!(table.close_all().await, 3);
        assert!(tcp_cancel.is_cancelled());
        assert!(assoc_cancel.is_cancelled());
        assert!(flow.cancel.is_cancelled());
        let snap = table.snapshot();
        assert_eq!(snap.active_tcp, 0);
        assert_eq!(snap.active_udp, 0);
        assert_eq!(snap.active_udp_associate, 0);
        assert_eq!(snap.total_tcp, 1);
        assert_eq!(snap.total_udp, 1);
        assert_eq!(snap.total_udp_associate, 1);
    }
}
