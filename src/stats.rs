use std::sync::atomic::{AtomicU64, Ordering};

use crate::table::FlowKind;

/// Aggregate transfer counters. `total_*` only ever grow; `active_*` follow
/// the connection table's sub-map sizes.
#[derive(Debug, Default)]
pub struct Stats {
    total_tcp: AtomicU64,
    active_tcp: AtomicU64,
    total_udp: AtomicU64,
    active_udp: AtomicU64,
    total_udp_associate: AtomicU64,
    active_udp_associate: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, kind: FlowKind) -> (&AtomicU64, &AtomicU64) {
        match kind {
            FlowKind::Tcp => (&self.total_tcp, &self.active_tcp),
            FlowKind::Udp => (&self.total_udp, &self.active_udp),
            FlowKind::UdpAssociate => (&self.total_udp_associate, &self.active_udp_associate),
        }
    }

    pub fn flow_opened(&self, kind: FlowKind) {
        let (total, active) = self.counters(kind);
        total.fetch_add(1, Ordering::Relaxed);
        active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_closed(&self, kind: FlowKind) {
        let (_, active) = self.counters(kind);
        active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_traffic(&self, sent: u64, received: u64) {
        if sent > 0 {
            self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        }
        if received > 0 {
            self.bytes_received.fetch_add(received, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_tcp: self.total_tcp.load(Ordering::Relaxed),
            active_tcp: self.active_tcp.load(Ordering::Relaxed),
            total_udp: self.total_udp.load(Ordering::Relaxed),
            active_udp: self.active_udp.load(Ordering::Relaxed),
            total_udp_associate: self.total_udp_associate.load(Ordering::Relaxed),
            active_udp_associate: self.active_udp_associate.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_tcp: u64,
    pub active_tcp: u64,
    pub total_udp: u64,
    pub active_udp: u64,
    pub total_udp_associate: u64,
    pub active_udp_associate: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
