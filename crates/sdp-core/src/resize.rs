//! Receive-buffer resize negotiation (CHRCVBUF / CHRCVBUF_ACK).

use crate::ring::seq_before;

/// An ack owed to the peer, sent once the receive ring has consumed every
/// buffer posted before the grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub granted_bytes: u32,
    pub grant_head: u32,
}

impl PendingAck {
    pub fn is_due(&self, rx_tail: u32) -> bool {
        !seq_before(rx_tail, self.grant_head)
    }
}

#[derive(Debug, Default)]
pub struct ResizeState {
    /// Our CHRCVBUF awaits its ack.
    pub request_outstanding: bool,
    /// The last ack did not grow the segment goal; automatic requests stop.
    pub peer_at_limit: bool,
    pub pending_ack: Option<PendingAck>,
}

/// Fragments to grant for a request of `requested_bytes` per buffer. Never
/// shrinks below `current`; growth is capped by the device sge limit and by
/// half the receive buffer budget.
pub fn compute_grant(
    requested_bytes: u32,
    current: u32,
    frag_size: u32,
    max_recv_sge: u32,
    rcvbuf: u64,
) -> u32 {
    let frag_size = frag_size.max(1);
    let wanted = requested_bytes.div_ceil(frag_size);
    let budget = (rcvbuf / (2 * frag_size as u64)).min(u32::MAX as u64) as u32;
    current.max(wanted.min(max_recv_sge).min(budget))
}
