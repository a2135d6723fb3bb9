//! Zero-copy advertisement state.
//!
//! A sender with a large write registers the tail of the buffer for remote
//! read and advertises it with SRC_AVAIL. The receiver pulls it with remote
//! reads, reporting each chunk with RDMA_RD_COMPL, or declines with
//! SEND_SM. Every response about an advertisement carries that
//! advertisement's sequence number as its ack, so a response that arrives
//! after the sender moved on is recognised and dropped.

use sdp_proto::SrcAvail;
use sdp_verbs::{RegionHandle, RemoteBuf};

use crate::ring::seq_before;

/// Why an outbound advertisement stopped short of completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbortFlags(u8);

impl AbortFlags {
    /// The peer declined (or aborted) the advertisement.
    pub const SEND_SM: AbortFlags = AbortFlags(1 << 0);
    /// Both sides advertised at once and this side backs off.
    pub const CROSS_SEND: AbortFlags = AbortFlags(1 << 1);
    pub const TIMEDOUT: AbortFlags = AbortFlags(1 << 2);
    pub const INTERRUPTED: AbortFlags = AbortFlags(1 << 3);

    pub fn contains(&self, other: AbortFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: AbortFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// The outbound advertisement. At most one per connection.
#[derive(Debug)]
pub struct TxSrcAvail {
    /// Registration of the advertised bytes; taken exactly once for release.
    pub region: Option<RegionHandle>,
    pub len: usize,
    pub inline_len: usize,
    pub bytes_acked: usize,
    pub abort: AbortFlags,
    /// Sequence number of the posted SRC_AVAIL; `None` while still queued.
    pub mseq: Option<u32>,
}

impl TxSrcAvail {
    pub fn new(region: RegionHandle, inline_len: usize) -> Self {
        Self {
            len: region.len as usize,
            region: Some(region),
            inline_len,
            bytes_acked: 0,
            abort: AbortFlags::default(),
            mseq: None,
        }
    }

    pub fn advert(region: &RegionHandle) -> SrcAvail {
        SrcAvail {
            len: region.len as u32,
            rkey: region.rkey,
            vaddr: region.addr,
        }
    }

    /// Whether a response acking `mseq_ack` predates this advertisement.
    pub fn is_stale(&self, mseq_ack: u32) -> bool {
        match self.mseq {
            None => true,
            Some(mseq) => seq_before(mseq_ack, mseq),
        }
    }

    /// Count `n` bytes read by the peer. Fails if the peer claims more than
    /// was advertised.
    pub fn ack(&mut self, n: usize) -> Result<(), usize> {
        let total = self.bytes_acked + n;
        if total > self.len {
            return Err(total);
        }
        self.bytes_acked = total;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_acked == self.len
    }
}

#[derive(Debug)]
pub enum RxReadState {
    /// Waiting for the reader to reach the advertised bytes.
    Advertised,
    ReadInflight {
        sink: RegionHandle,
        len: usize,
        seq: u32,
    },
}

/// The inbound advertisement. At most one per connection.
#[derive(Debug)]
pub struct RxSrcAvail {
    pub mseq: u32,
    /// Part of the advertised region not yet read.
    pub remote: RemoteBuf,
    pub state: RxReadState,
    /// SRCAVAIL_CANCEL arrived while a read was in flight.
    pub cancelled: bool,
    pub bytes_read: usize,
}

impl RxSrcAvail {
    pub fn new(mseq: u32, advert: &SrcAvail) -> Self {
        Self {
            mseq,
            remote: RemoteBuf::new(advert.vaddr, advert.len as u64, advert.rkey),
            state: RxReadState::Advertised,
            cancelled: false,
            bytes_read: 0,
        }
    }

    pub fn is_read_inflight(&self) -> bool {
        matches!(self.state, RxReadState::ReadInflight { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdp_verbs::AccessFlags;

    fn region(len: u64) -> RegionHandle {
        RegionHandle {
            id: 1,
            lkey: 7,
            rkey: 7,
            addr: 0x1000,
            len,
            access: AccessFlags::REMOTE_READ,
        }
    }

    #[test]
    fn test_abort_flags() {
        let mut f = AbortFlags::default();
        assert!(f.is_empty());
        f.insert(AbortFlags::TIMEDOUT);
        f.insert(AbortFlags::INTERRUPTED);
        assert!(f.contains(AbortFlags::TIMEDOUT));
        assert!(!f.contains(AbortFlags::SEND_SM));
    }

    #[test]
    fn test_ack_accounting() {
        let mut sa = TxSrcAvail::new(region(100), 10);
        assert_eq!(sa.len, 100);
        sa.ack(60).unwrap();
        assert!(!sa.is_complete());
        assert_eq!(sa.ack(41), Err(101));
        assert_eq!(sa.bytes_acked, 60);
        sa.ack(40).unwrap();
        assert!(sa.is_complete());
    }

    #[test]
    fn test_staleness() {
        let mut sa = TxSrcAvail::new(region(10), 0);
        // Not posted yet: every response is stale.
        assert!(sa.is_stale(100));
        sa.mseq = Some(20);
        assert!(sa.is_stale(19));
        assert!(!sa.is_stale(20));
        assert!(!sa.is_stale(25));
    }

    #[test]
    fn test_rx_advert() {
        let adv = TxSrcAvail::advert(&region(4096));
        let rx = RxSrcAvail::new(9, &adv);
        assert_eq!(rx.remote.size(), 4096);
        assert_eq!(rx.remote.rkey(), 7);
        assert!(!rx.is_read_inflight());
    }
}
