//! Credit-based flow control.
//!
//! A send consumes one of the peer's posted receive buffers. The peer tells
//! us its posted depth in the `bufs` field of every header together with the
//! highest sequence it has received; what remains after our sends it had
//! not yet seen is what we may still post.

/// Credits held back from data so that control messages (DISCONN, ABORT,
/// resize and zero-copy responses) can always go out.
pub const CREDIT_RESERVE: i64 = 2;

/// Receives always kept posted, whatever the receive buffer budget says.
/// Enough for the peer to hold one data credit above the reserve.
pub const MIN_POSTED_RECVS: u32 = CREDIT_RESERVE as u32 + 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credits {
    /// Sends we may still post.
    pub tx_credits: i64,
    /// Receive depth last advertised to the peer, less what it has used
    /// since.
    pub remote_credits: u32,
}

impl Credits {
    /// Initial credits from the peer's HELLO / HELLO_ACK (`bufs`) and the
    /// depth we advertised in ours.
    pub fn from_handshake(bufs: u16, advertised: u32) -> Self {
        Self {
            tx_credits: bufs as i64,
            remote_credits: advertised,
        }
    }

    /// Recompute from a received header. `tx_head` is the sequence the next
    /// send will carry.
    pub fn on_header(&mut self, mseq_ack: u32, tx_head: u32, bufs: u16) {
        let unseen = tx_head.wrapping_sub(mseq_ack).wrapping_sub(1) as i32 as i64;
        self.tx_credits = bufs as i64 - unseen;
    }

    pub fn on_receive(&mut self) {
        self.remote_credits = self.remote_credits.saturating_sub(1);
    }

    /// A message was posted while `posted` receives were outstanding.
    pub fn on_post(&mut self, posted: u32) {
        self.tx_credits -= 1;
        self.remote_credits = posted;
    }

    pub fn can_post_data(&self) -> bool {
        self.tx_credits > CREDIT_RESERVE
    }

    pub fn can_post_control(&self) -> bool {
        self.tx_credits > 0
    }

    /// Whether a zero-length DATA message should re-advertise our receive
    /// depth.
    ///
    /// A shallow advertised depth is refreshed on growth by two buffers
    /// rather than one, so two budget-limited peers do not answer each
    /// other's updates forever.
    pub fn needs_update(&self, posted: u32) -> bool {
        let advertised = self.remote_credits;
        let threshold = if advertised > CREDIT_RESERVE as u32 {
            advertised + advertised / 2
        } else {
            advertised + 1
        };
        posted > threshold && self.can_post_control()
    }
}

/// Whether one more receive buffer of `buf_capacity` bytes should be posted.
pub fn wants_recv(
    posted: u32,
    ring_capacity: u32,
    rx_bytes_queued: usize,
    buf_capacity: usize,
    rcvbuf: u64,
) -> bool {
    if posted >= ring_capacity {
        return false;
    }
    if posted < MIN_POSTED_RECVS {
        return true;
    }
    let committed = rx_bytes_queued as u64 + posted as u64 * buf_capacity as u64;
    committed < rcvbuf
}
