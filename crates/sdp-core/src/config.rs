//! Engine configuration.

use std::time::Duration;

use sdp_config::Config;
use sdp_proto::BSDH_SIZE;
use sdp_verbs::{DeviceInfo, QpCaps};
use serde::{Deserialize, Serialize};

/// Per-stack configuration. Connections snapshot it when they are created.
#[derive(Clone, Debug, Config, Serialize, Deserialize)]
#[config(check = Self::check_bounds)]
#[serde(default)]
pub struct SdpConfig {
    // ---- Rings ----
    /// Receive ring depth: the most receives a connection keeps posted.
    #[config(default = 64, min = 4, max = 4096)]
    pub rx_ring_size: u32,

    /// Send ring depth: the most sends in flight per connection.
    #[config(default = 64, min = 4, max = 4096)]
    pub tx_ring_size: u32,

    /// Bytes per buffer fragment (one scatter/gather entry).
    #[config(default = 4096, min = 512, max = 65536)]
    pub frag_size: u32,

    /// Fragments per receive buffer at connection start. Clamped to the
    /// device's receive sge limit.
    #[config(default = 16, min = 1, max = 256)]
    pub recv_frags: u32,

    // ---- Buffer budgets ----
    /// Bytes an application may have queued but not yet completed on send.
    #[config(default = 1048576, min = 4096)]
    pub sndbuf: u64,

    /// Bytes of received-but-unread data plus posted receive capacity.
    #[config(default = 4194304, min = 8192)]
    pub rcvbuf: u64,

    // ---- Zero-copy ----
    #[config(default = true)]
    pub zcopy_enabled: bool,

    /// Writes at least this large are advertised for remote read.
    #[config(default = 65536, min = 1, hot_updated)]
    pub zcopy_thresh: u64,

    /// Largest single remote read.
    #[config(default = 262144, min = 4096)]
    pub max_read_chunk: u32,

    /// How long a sender waits for the peer to consume an advertisement.
    #[config(default = 1000, min = 1, hot_updated)]
    pub zcopy_adv_timeout_ms: u64,

    /// How long a sender waits for the peer's answer to a cancellation.
    #[config(default = 500, min = 1, hot_updated)]
    pub zcopy_cancel_timeout_ms: u64,

    // ---- Send coalescing ----
    /// Disable coalescing of small sends on new sockets.
    #[config(default = false)]
    pub nodelay: bool,

    #[config(default = 100, min = 1, hot_updated)]
    pub nagle_timeout_ms: u64,

    // ---- Resize ----
    /// Request deeper peer receive buffers when a write exceeds the current
    /// segment goal.
    #[config(default = true)]
    pub auto_resize: bool,

    // ---- Timeouts ----
    #[config(default = 10000, min = 1)]
    pub connect_timeout_ms: u64,

    /// Guard on FIN_WAIT1 / LAST_ACK before the fabric connection is torn
    /// down unilaterally.
    #[config(default = 10000, min = 1)]
    pub fin_wait_timeout_ms: u64,

    /// Period of the fallback completion poll.
    #[config(default = 50, min = 1, max = 10000, hot_updated)]
    pub poll_interval_ms: u64,

    // ---- Interrupt moderation ----
    #[config(default = true)]
    pub moderation_enabled: bool,

    #[config(default = 16, min = 1, max = 65535)]
    pub moderation_count: u32,

    #[config(default = 250, min = 10, hot_updated)]
    pub moderation_sample_ms: u64,

    #[config(default = 0, max = 65535, hot_updated)]
    pub moderation_usec_low: u32,

    #[config(default = 128, max = 65535, hot_updated)]
    pub moderation_usec_high: u32,

    /// Packets per second below which the low bound applies.
    #[config(default = 400000, min = 1, hot_updated)]
    pub moderation_rate_low: u64,

    /// Packets per second above which the high bound applies.
    #[config(default = 450000, min = 1, hot_updated)]
    pub moderation_rate_high: u64,

    /// Below this packet rate moderation stays at the low bound.
    #[config(default = 7812, hot_updated)]
    pub moderation_rate_thresh: u64,
}

impl SdpConfig {
    /// Field bounds plus the rules that span fields.
    pub fn check(&self) -> Result<(), sdp_config::ConfigError> {
        self.validate()
    }

    /// Rules spanning several fields. Part of `validate`, so hot updates
    /// through a `ConfigManager` are held to them too.
    fn check_bounds(&self) -> Result<(), sdp_config::ConfigError> {
        if self.moderation_usec_low > self.moderation_usec_high {
            return Err(sdp_config::ConfigError::Invalid(
                "moderation_usec_low exceeds moderation_usec_high".into(),
            ));
        }
        if self.moderation_rate_low >= self.moderation_rate_high {
            return Err(sdp_config::ConfigError::Invalid(
                "moderation_rate_low must be below moderation_rate_high".into(),
            ));
        }
        Ok(())
    }

    /// Queue-pair sizing for a connection on `device`. One extra send slot
    /// is reserved for the single outstanding remote read.
    pub fn qp_caps(&self, device: &DeviceInfo) -> QpCaps {
        let caps = device.caps;
        QpCaps {
            max_send_wr: (self.tx_ring_size + 1).min(caps.max_qp_wr),
            max_recv_wr: self.rx_ring_size.min(caps.max_qp_wr),
            max_send_sge: caps.max_send_sge,
            max_recv_sge: caps.max_recv_sge,
        }
    }

    /// Fragments per receive buffer the device allows at connection start.
    pub fn initial_recv_frags(&self, device: &DeviceInfo) -> u32 {
        self.recv_frags.min(device.caps.max_recv_sge).max(1)
    }

    /// Bytes a receive buffer of `frags` fragments must hold, header included.
    pub fn recv_buf_capacity(&self, frags: u32) -> usize {
        BSDH_SIZE + frags as usize * self.frag_size as usize
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn fin_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.fin_wait_timeout_ms)
    }

    pub fn nagle_timeout(&self) -> Duration {
        Duration::from_millis(self.nagle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn zcopy_adv_timeout(&self) -> Duration {
        Duration::from_millis(self.zcopy_adv_timeout_ms)
    }

    pub fn zcopy_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.zcopy_cancel_timeout_ms)
    }

    pub fn moderation_sample(&self) -> Duration {
        Duration::from_millis(self.moderation_sample_ms)
    }
}
