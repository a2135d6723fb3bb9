//! Completion processing.
//!
//! Both completion queues are drained under the connection lock, receives
//! first. Each completion releases its ring slot; received messages are
//! checked for sequence, refresh the credit view and are dispatched by
//! message id.

use std::collections::VecDeque;

use bytes::Bytes;
use sdp_proto::{Bsdh, HeaderFlags, Message, ProtoError, SrcAvail};
use sdp_verbs::{CqKind, WcStatus, WorkCompletion};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::conn::{ConnInner, Connection, Role, RxItem};
use crate::error::SdpError;
use crate::resize::{compute_grant, PendingAck};
use crate::ring::{seq_before, OpTag, RingError, WrId};
use crate::state::TcpState;
use crate::zcopy::{AbortFlags, RxReadState, RxSrcAvail};

/// Completions taken from one queue per poll call.
const POLL_BATCH: usize = 16;

/// A completion the connection cannot make sense of. Always fatal.
#[derive(Debug, Error)]
enum CompletionFault {
    #[error("unknown work-request id {0:#x}")]
    UnknownWrId(u64),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("successful completion carried no data")]
    MissingData,

    #[error("expected mseq {expected}, got {got}")]
    Sequence { expected: u32, got: u32 },

    #[error("peer acked {acked} bytes of a {advertised} byte advertisement")]
    OverAck { acked: usize, advertised: usize },

    #[error("remote read {0} completed with no read in flight")]
    UnexpectedRead(u32),
}

/// Drop the stream marker of advertisement `mseq`.
pub(crate) fn remove_advert_marker(queue: &mut VecDeque<RxItem>, mseq: u32) {
    queue.retain(|item| !matches!(item, RxItem::Advert(s) if *s == mseq));
}

impl Connection {
    /// Reap completions, make progress and wake waiters. Returns the number
    /// of completions reaped.
    pub(crate) fn poll_once(&self) -> usize {
        if self.is_destroyed() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let n = self.poll_locked(&mut inner);
        self.drive(&mut inner);
        if n > 0 {
            self.notify.notify_waiters();
        }
        n
    }

    /// Drain both completion queues. Completions are left alone while the
    /// handshake is in progress; the establish handler reaps them.
    pub(crate) fn poll_locked(&self, inner: &mut ConnInner) -> usize {
        if inner.state.is_synchronizing()
            || matches!(inner.state, TcpState::Listen | TcpState::Close)
        {
            return 0;
        }
        let mut total = 0;
        loop {
            let mut reaped = 0;
            for cq in [CqKind::Recv, CqKind::Send] {
                for wc in self.fabric.poll_completion_queue(self.ep, cq, POLL_BATCH) {
                    reaped += 1;
                    self.on_completion(inner, wc);
                    if inner.state == TcpState::Close {
                        return total + reaped;
                    }
                }
            }
            if reaped == 0 {
                return total;
            }
            total += reaped;
        }
    }

    fn on_completion(&self, inner: &mut ConnInner, wc: WorkCompletion) {
        let res = match WrId::decode(wc.wr_id) {
            None => Err(CompletionFault::UnknownWrId(wc.wr_id)),
            Some(id) => match id.op {
                OpTag::Send => self.on_send_complete(inner, id.seq, wc),
                OpTag::Recv => self.on_recv_complete(inner, id.seq, wc),
                OpTag::RdmaRead => self.on_read_complete(inner, id.seq, wc),
            },
        };
        if let Err(fault) = res {
            warn!(ep = %self.ep, state = %inner.state, error = %fault, "resetting connection");
            self.fail(inner, SdpError::ConnectionReset);
        }
    }

    fn on_wc_error(&self, inner: &mut ConnInner, what: &'static str, status: WcStatus) {
        if status == WcStatus::WrFlushError {
            inner.flushed = true;
        }
        if self.closing_quietly(inner) {
            trace!(ep = %self.ep, what, ?status, "work failed while closing");
            return;
        }
        warn!(ep = %self.ep, what, ?status, "work request failed, resetting connection");
        self.fail(inner, SdpError::ConnectionReset);
    }

    fn on_send_complete(
        &self,
        inner: &mut ConnInner,
        seq: u32,
        wc: WorkCompletion,
    ) -> Result<(), CompletionFault> {
        let desc = inner.tx_ring.pop(seq)?;
        self.unmap_all(desc.mappings);
        inner.tx_bytes_queued = inner.tx_bytes_queued.saturating_sub(desc.payload_len);
        if !wc.status.is_success() {
            self.on_wc_error(inner, "send", wc.status);
        }
        Ok(())
    }

    fn on_recv_complete(
        &self,
        inner: &mut ConnInner,
        seq: u32,
        wc: WorkCompletion,
    ) -> Result<(), CompletionFault> {
        let desc = inner.rx_ring.pop(seq)?;
        self.unmap_all(desc.mappings);
        if !wc.status.is_success() {
            self.on_wc_error(inner, "receive", wc.status);
            return Ok(());
        }
        self.stats.rx_packets.increment();
        let data = wc.data.ok_or(CompletionFault::MissingData)?;
        let (hdr, msg) = Message::decode(data)?;
        self.on_message(inner, hdr, msg)
    }

    fn on_message(
        &self,
        inner: &mut ConnInner,
        hdr: Bsdh,
        msg: Message,
    ) -> Result<(), CompletionFault> {
        let expected = inner.mseq_ack.wrapping_add(1);
        if hdr.mseq != expected {
            return Err(CompletionFault::Sequence {
                expected,
                got: hdr.mseq,
            });
        }
        inner.mseq_ack = hdr.mseq;
        inner.credits.on_receive();
        inner
            .credits
            .on_header(hdr.mseq_ack, inner.tx_ring.head(), hdr.bufs);
        if let Some(last) = inner.nagle_last_unacked {
            if !seq_before(hdr.mseq_ack, last) {
                inner.nagle_last_unacked = None;
            }
        }
        trace!(
            ep = %self.ep,
            mid = ?hdr.mid,
            mseq = hdr.mseq,
            mseq_ack = hdr.mseq_ack,
            bufs = hdr.bufs,
            credits = inner.credits.tx_credits,
            "received"
        );

        match msg {
            Message::Data(payload) => self.on_data(inner, hdr.flags, payload),
            Message::SrcAvail { advert, inline } => {
                self.on_src_avail(inner, hdr.mseq, advert, inline)
            }
            Message::SrcAvailCancel => self.on_src_avail_cancel(inner, hdr.mseq),
            Message::SendSm => self.on_zcopy_response(inner, hdr.mseq_ack, None)?,
            Message::RdmaRdCompl(n) => self.on_zcopy_response(inner, hdr.mseq_ack, Some(n))?,
            Message::ChRcvBuf(size) => self.on_resize_request(inner, size),
            Message::ChRcvBufAck(size) => self.on_resize_ack(inner, size),
            Message::Disconn => self.on_disconn(inner),
            Message::Abort => {
                debug!(ep = %self.ep, state = %inner.state, "peer aborted");
                self.fail(inner, SdpError::ConnectionReset);
            }
            Message::SinkAvail(_) => warn!(ep = %self.ep, "ignoring SINK_AVAIL"),
        }
        Ok(())
    }

    fn queue_rx_data(&self, inner: &mut ConnInner, data: Bytes) {
        self.stats.rx_bytes.add(data.len() as u64);
        inner.rx_bytes_queued += data.len();
        inner.rx_queue.push_back(RxItem::Data(data));
    }

    fn on_data(&self, inner: &mut ConnInner, flags: HeaderFlags, mut payload: Bytes) {
        if payload.is_empty() {
            // Credit update.
            return;
        }
        if flags.contains(HeaderFlags::OOB_PRES) {
            let last = payload.len() - 1;
            inner.urgent = Some(payload[last]);
            payload.truncate(last);
        }
        if inner.read_closed || payload.is_empty() {
            return;
        }
        self.queue_rx_data(inner, payload);
    }

    fn on_src_avail(&self, inner: &mut ConnInner, mseq: u32, advert: SrcAvail, inline: Bytes) {
        if !inline.is_empty() && !inner.read_closed {
            self.queue_rx_data(inner, inline);
        }

        let cancelled = inner
            .cancel_mseq
            .is_some_and(|c| !seq_before(c, mseq));
        let crossing = inner.tx_sa.is_some();
        if crossing && self.role == Role::Active {
            // The active side withdraws its own offer; both sides decline
            // the incoming one, so the exchange falls back to copying.
            if let Some(tx) = inner.tx_sa.as_mut() {
                tx.abort.insert(AbortFlags::CROSS_SEND);
            }
        }

        let decline = if !self.zcopy_allowed(inner) {
            Some("zero-copy not negotiated")
        } else if cancelled {
            Some("already cancelled")
        } else if crossing {
            Some("crossing advertisement")
        } else if inner.rx_sa.is_some() {
            Some("advertisement outstanding")
        } else if inner.read_closed {
            Some("read side closed")
        } else if advert.len == 0 {
            Some("empty advertisement")
        } else {
            None
        };
        if let Some(reason) = decline {
            debug!(ep = %self.ep, mseq, len = advert.len, reason, "declining SRC_AVAIL");
            self.stats.zcopy_declined.increment();
            self.queue_ctrl(inner, Message::SendSm, Some(mseq));
            return;
        }

        trace!(ep = %self.ep, mseq, len = advert.len, "SRC_AVAIL accepted");
        inner.rx_sa = Some(RxSrcAvail::new(mseq, &advert));
        inner.rx_queue.push_back(RxItem::Advert(mseq));
    }

    fn on_src_avail_cancel(&self, inner: &mut ConnInner, mseq: u32) {
        inner.cancel_mseq = Some(mseq);
        let Some(rx) = inner.rx_sa.as_mut() else {
            return;
        };
        if rx.is_read_inflight() {
            rx.cancelled = true;
            return;
        }
        let adv = rx.mseq;
        inner.rx_sa = None;
        remove_advert_marker(&mut inner.rx_queue, adv);
        debug!(ep = %self.ep, mseq = adv, "advertisement cancelled by peer");
        self.queue_ctrl(inner, Message::SendSm, Some(adv));
    }

    /// SEND_SM (`read` is `None`) or RDMA_RD_COMPL for our advertisement.
    fn on_zcopy_response(
        &self,
        inner: &mut ConnInner,
        ack: u32,
        read: Option<u32>,
    ) -> Result<(), CompletionFault> {
        let Some(tx) = inner.tx_sa.as_mut().filter(|tx| !tx.is_stale(ack)) else {
            self.stats.stale_zcopy_responses.increment();
            debug!(ep = %self.ep, ack, "dropping stale zero-copy response");
            return Ok(());
        };
        match read {
            None => tx.abort.insert(AbortFlags::SEND_SM),
            Some(n) => {
                let advertised = tx.len;
                tx.ack(n as usize)
                    .map_err(|acked| CompletionFault::OverAck { acked, advertised })?;
            }
        }
        Ok(())
    }

    fn on_resize_request(&self, inner: &mut ConnInner, size: u32) {
        let granted = compute_grant(
            size,
            inner.recv_frags,
            self.config.frag_size,
            self.fabric.device().caps.max_recv_sge,
            self.config.rcvbuf,
        );
        // Buffers posted before the grant are still the old size; the ack
        // waits until they are consumed.
        let grant_head = if granted > inner.recv_frags {
            inner.recv_frags = granted;
            inner.rx_ring.head()
        } else {
            inner.rx_ring.tail()
        };
        let granted_bytes = granted.saturating_mul(self.config.frag_size);
        debug!(ep = %self.ep, requested = size, granted_bytes, "resize requested by peer");
        inner.resize.pending_ack = Some(PendingAck {
            granted_bytes,
            grant_head,
        });
    }

    fn on_resize_ack(&self, inner: &mut ConnInner, size: u32) {
        inner.resize.request_outstanding = false;
        inner.peer_rcv_size = size;
        let old = inner.xmit_size_goal;
        let goal = (size as usize).min(self.own_send_limit()).max(1);
        inner.xmit_size_goal = goal;
        if goal <= old {
            inner.resize.peer_at_limit = true;
        }
        debug!(ep = %self.ep, size, old_goal = old, goal, "resize acked");
    }

    fn on_disconn(&self, inner: &mut ConnInner) {
        inner.peer_closed = true;
        match inner.state {
            TcpState::Established | TcpState::SynRecv => {
                self.set_state(inner, TcpState::CloseWait);
            }
            TcpState::FinWait1 if inner.disconn_sent => self.enter_time_wait(inner),
            // Ours is still queued; it goes out once the send side drains.
            TcpState::FinWait1 => self.set_state(inner, TcpState::LastAck),
            _ => {}
        }
    }

    fn on_read_complete(
        &self,
        inner: &mut ConnInner,
        seq: u32,
        wc: WorkCompletion,
    ) -> Result<(), CompletionFault> {
        let Some(rx) = inner.rx_sa.as_mut() else {
            return Err(CompletionFault::UnexpectedRead(seq));
        };
        let sink = match &rx.state {
            RxReadState::ReadInflight { seq: s, sink, .. } if *s == seq => *sink,
            _ => return Err(CompletionFault::UnexpectedRead(seq)),
        };
        rx.state = RxReadState::Advertised;
        let mseq = rx.mseq;
        let abandoned = rx.cancelled || inner.read_closed;
        if let Err(e) = self.fabric.release_region(&sink) {
            debug!(ep = %self.ep, error = %e, "release of read sink failed");
        }

        if !wc.status.is_success() {
            self.on_wc_error(inner, "remote read", wc.status);
            return Ok(());
        }
        if abandoned {
            inner.rx_sa = None;
            remove_advert_marker(&mut inner.rx_queue, mseq);
            self.queue_ctrl(inner, Message::SendSm, Some(mseq));
            return Ok(());
        }

        let data = wc.data.ok_or(CompletionFault::MissingData)?;
        let n = data.len();
        let done = match inner.rx_sa.as_mut() {
            Some(rx) => {
                rx.remote.advance(n as u64);
                rx.bytes_read += n;
                rx.remote.is_empty()
            }
            None => true,
        };
        self.stats.rdma_read_bytes.add(n as u64);
        self.stats.rx_bytes.add(n as u64);
        let pos = inner
            .rx_queue
            .iter()
            .position(|item| matches!(item, RxItem::Advert(s) if *s == mseq))
            .unwrap_or(inner.rx_queue.len());
        inner.rx_queue.insert(pos, RxItem::Data(data));
        inner.rx_bytes_queued += n;
        self.queue_ctrl(inner, Message::RdmaRdCompl(n as u32), Some(mseq));
        trace!(ep = %self.ep, mseq, n, done, "remote read complete");
        if done {
            inner.rx_sa = None;
            remove_advert_marker(&mut inner.rx_queue, mseq);
        }
        Ok(())
    }
}
