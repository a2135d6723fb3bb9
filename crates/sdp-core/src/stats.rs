//! Per-connection counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::state::TcpState;

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters updated by the completion engine and the send path. The
/// moderation sampler reads the packet counters.
#[derive(Debug, Default)]
pub struct ConnStats {
    pub tx_packets: Counter,
    pub rx_packets: Counter,
    pub tx_bytes: Counter,
    pub rx_bytes: Counter,
    pub credit_updates: Counter,
    pub nagle_deferrals: Counter,
    pub zcopy_sends: Counter,
    pub zcopy_fallbacks: Counter,
    pub zcopy_cancels: Counter,
    pub zcopy_declined: Counter,
    pub rdma_read_bytes: Counter,
    pub stale_zcopy_responses: Counter,
}

/// Point-in-time view of a socket, returned by `SdpSocket::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct SocketStats {
    pub state: TcpState,
    pub tx_credits: i64,
    pub remote_credits: u32,
    pub posted_recvs: u32,
    pub tx_outstanding: u32,
    pub recv_frags: u32,
    pub xmit_size_goal: usize,
    pub tx_bytes_queued: usize,
    pub rx_bytes_queued: usize,

    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub credit_updates: u64,
    pub nagle_deferrals: u64,
    pub zcopy_sends: u64,
    pub zcopy_fallbacks: u64,
    pub zcopy_cancels: u64,
    pub zcopy_declined: u64,
    pub rdma_read_bytes: u64,
    pub stale_zcopy_responses: u64,
}
