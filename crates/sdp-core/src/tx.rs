//! Send path.
//!
//! Small and medium writes are copied into DATA messages no larger than the
//! segment goal. Large blocking writes are offered to the peer for remote
//! read with SRC_AVAIL; if the peer declines, the offer times out or is
//! cancelled, the bytes it did not read are sent by copy instead.

use bytes::{Bytes, BytesMut};
use sdp_proto::{Capabilities, HeaderFlags, Message, SRC_AVAIL_SIZE};
use sdp_verbs::AccessFlags;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::conn::{ConnInner, Connection, TxItem};
use crate::error::SdpError;
use crate::zcopy::{AbortFlags, TxSrcAvail};

/// Per-call send options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags(u8);

impl SendFlags {
    /// Post the data without waiting to coalesce more.
    pub const PUSH: SendFlags = SendFlags(1 << 0);
    /// The last byte is urgent data, delivered out of band.
    pub const URGENT: SendFlags = SendFlags(1 << 1);

    pub const fn empty() -> Self {
        SendFlags(0)
    }

    pub fn contains(&self, other: SendFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for SendFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        SendFlags(self.0 | rhs.0)
    }
}

/// How an outbound advertisement ended.
#[derive(Debug)]
enum AdvertOutcome {
    /// The peer read everything.
    Done,
    /// The peer declined; copy what it did not read.
    Fallback,
    /// We withdraw the offer.
    Cancel,
    Failed(SdpError),
}

impl Connection {
    /// Queue `data` for sending. Returns once every byte is queued or, for
    /// zero-copy, once the peer has the data.
    pub(crate) async fn send(&self, data: Bytes, flags: SendFlags) -> Result<usize, SdpError> {
        let _serial = self.send_lock.lock().await;
        if data.is_empty() {
            return Ok(0);
        }
        let zcopy = {
            let inner = self.inner.lock();
            self.check_writable(&inner)?;
            !flags.contains(SendFlags::URGENT)
                && !inner.nonblocking
                && self.zcopy_allowed(&inner)
                && data.len() as u64 >= self.config.zcopy_thresh
        };
        if zcopy {
            self.send_zcopy(data, flags).await
        } else {
            self.send_copy(data, flags, false).await
        }
    }

    /// Copy `data` into the send queue once the send buffer has room. A
    /// fallback from zero-copy is neither interruptible nor non-blocking:
    /// part of the write may already be with the peer.
    async fn send_copy(
        &self,
        data: Bytes,
        flags: SendFlags,
        fallback: bool,
    ) -> Result<usize, SdpError> {
        let len = data.len();
        self.wait_for(None, !fallback, |inner| {
            if let Err(e) = self.check_writable(inner) {
                return Some(Err(e));
            }
            if self.enqueue_send(inner, &data, flags) {
                self.drive(inner);
                return Some(Ok(len));
            }
            if inner.nonblocking && !fallback {
                return Some(Err(SdpError::WouldBlock));
            }
            None
        })
        .await?
    }

    /// Admit `data` against the send buffer. An idle send queue always
    /// admits one write, however large.
    pub(crate) fn enqueue_send(&self, inner: &mut ConnInner, data: &[u8], flags: SendFlags) -> bool {
        let fits = inner.tx_bytes_queued == 0
            || inner.tx_bytes_queued + data.len() <= self.config.sndbuf as usize;
        if !fits {
            return false;
        }
        self.maybe_auto_resize(inner, data.len());
        self.enqueue_data(inner, data, flags);
        true
    }

    /// Split `data` into DATA messages of at most the segment goal,
    /// topping up a queued short message first.
    fn enqueue_data(&self, inner: &mut ConnInner, data: &[u8], flags: SendFlags) {
        let urgent = flags.contains(SendFlags::URGENT);
        let push = flags.contains(SendFlags::PUSH);
        let goal = inner.xmit_size_goal.max(1);
        inner.tx_bytes_queued += data.len();

        let mut rest = data;
        if !urgent {
            if let Some(TxItem::Data {
                payload,
                flags: queued_flags,
                push: queued_push,
            }) = inner.tx_queue.back_mut()
            {
                if queued_flags.is_empty() && !*queued_push && payload.len() < goal {
                    let take = (goal - payload.len()).min(rest.len());
                    payload.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                    if rest.is_empty() && push {
                        *queued_push = true;
                    }
                }
            }
        }

        while !rest.is_empty() {
            let (segment, tail) = rest.split_at(rest.len().min(goal));
            rest = tail;
            let last = rest.is_empty();
            let header_flags = match (urgent, last) {
                (true, true) => HeaderFlags::OOB_PEND | HeaderFlags::OOB_PRES,
                (true, false) => HeaderFlags::OOB_PEND,
                (false, _) => HeaderFlags::empty(),
            };
            inner.tx_queue.push_back(TxItem::Data {
                payload: BytesMut::from(segment),
                flags: header_flags,
                push: push && last,
            });
        }
    }

    /// Ask the peer for receive buffers that fit a `len` byte write.
    fn maybe_auto_resize(&self, inner: &mut ConnInner, len: usize) {
        let limit = self.own_send_limit();
        if !self.config.auto_resize
            || len <= inner.xmit_size_goal
            || inner.xmit_size_goal >= limit
            || !inner.peer_caps.contains(Capabilities::RESIZE)
            || inner.resize.request_outstanding
            || inner.resize.peer_at_limit
        {
            return;
        }
        let frag = self.config.frag_size as usize;
        let want = len.min(limit).div_ceil(frag) * frag;
        inner.resize.request_outstanding = true;
        debug!(ep = %self.ep, len, want, goal = inner.xmit_size_goal, "requesting larger peer buffers");
        self.queue_ctrl(inner, Message::ChRcvBuf(want as u32), None);
    }

    async fn send_zcopy(&self, data: Bytes, flags: SendFlags) -> Result<usize, SdpError> {
        let len = data.len();
        let goal = self.inner.lock().xmit_size_goal;
        let inline_len = goal.saturating_sub(SRC_AVAIL_SIZE).min(len);
        if inline_len >= len {
            return self.send_copy(data, flags, false).await;
        }
        let region = match self
            .fabric
            .register_region(data.slice(inline_len..), AccessFlags::REMOTE_READ)
        {
            Ok(region) => region,
            Err(e) => {
                debug!(ep = %self.ep, error = %e, "registration failed, sending by copy");
                return self.send_copy(data, flags, false).await;
            }
        };

        let inline = data.slice(..inline_len);
        let mut region = Some(region);
        let sndbuf = self.config.sndbuf as usize;
        let admitted = self
            .wait_for(None, true, |inner| {
                if let Err(e) = self.check_writable(inner) {
                    return Some(Err(e));
                }
                if inner.tx_bytes_queued != 0 && inner.tx_bytes_queued + inline_len > sndbuf {
                    return None;
                }
                let region = region.take()?;
                inner.tx_sa = Some(TxSrcAvail::new(region, inline_len));
                inner.tx_bytes_queued += inline_len;
                inner.tx_queue.push_back(TxItem::SrcAvail {
                    inline: inline.clone(),
                });
                self.drive(inner);
                Some(Ok(()))
            })
            .await
            .map_err(SdpError::from)
            .and_then(|r| r);
        if let Err(e) = admitted {
            if let Some(region) = region.take() {
                if let Err(re) = self.fabric.release_region(&region) {
                    debug!(ep = %self.ep, error = %re, "release of unadvertised region failed");
                }
            }
            return Err(e);
        }
        trace!(ep = %self.ep, len, inline_len, "advertisement queued");

        let deadline = Instant::now() + self.config.zcopy_adv_timeout();
        let outcome = match self
            .wait_for(Some(deadline), false, advert_outcome)
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                if let Some(tx) = self.inner.lock().tx_sa.as_mut() {
                    tx.abort.insert(AbortFlags::TIMEDOUT);
                }
                AdvertOutcome::Cancel
            }
        };

        match outcome {
            AdvertOutcome::Done => {
                self.finish_advert();
                self.stats.zcopy_sends.increment();
                Ok(len)
            }
            AdvertOutcome::Failed(e) => {
                self.finish_advert();
                Err(e)
            }
            AdvertOutcome::Fallback => {
                let acked = self.finish_advert();
                self.stats.zcopy_fallbacks.increment();
                debug!(ep = %self.ep, acked, "peer declined advertisement");
                self.copy_rest(&data, inline_len + acked, flags).await
            }
            AdvertOutcome::Cancel => self.cancel_advert(&data, inline_len, flags).await,
        }
    }

    /// Withdraw the outbound advertisement and send what the peer did not
    /// read by copy.
    async fn cancel_advert(
        &self,
        data: &Bytes,
        inline_len: usize,
        flags: SendFlags,
    ) -> Result<usize, SdpError> {
        self.stats.zcopy_cancels.increment();
        let posted = {
            let mut inner = self.inner.lock();
            let abort = inner.tx_sa.as_ref().map(|sa| sa.abort);
            debug!(ep = %self.ep, ?abort, "cancelling advertisement");
            if inner.tx_sa.as_ref().and_then(|sa| sa.mseq).is_some() {
                self.queue_ctrl(&mut inner, Message::SrcAvailCancel, None);
                self.drive(&mut inner);
                true
            } else {
                inner
                    .tx_queue
                    .retain(|item| !matches!(item, TxItem::SrcAvail { .. }));
                inner.tx_bytes_queued = inner.tx_bytes_queued.saturating_sub(inline_len);
                false
            }
        };
        if !posted {
            self.finish_advert();
            return self.copy_rest(data, 0, flags).await;
        }

        let deadline = Instant::now() + self.config.zcopy_cancel_timeout();
        let answered = self
            .wait_for(Some(deadline), false, |inner| {
                if let Some(e) = &inner.error {
                    return Some(Err(e.clone()));
                }
                match inner.tx_sa.as_ref() {
                    None => Some(Err(SdpError::NotConnected)),
                    Some(tx) if tx.is_complete() => Some(Ok(true)),
                    Some(tx) if tx.abort.contains(AbortFlags::SEND_SM) => Some(Ok(false)),
                    Some(_) => None,
                }
            })
            .await;
        let acked = self.finish_advert();
        match answered {
            Ok(Err(e)) => Err(e),
            Ok(Ok(true)) => {
                self.stats.zcopy_sends.increment();
                Ok(data.len())
            }
            Ok(Ok(false)) | Err(_) => self.copy_rest(data, inline_len + acked, flags).await,
        }
    }

    /// Drop the outbound advertisement and release its region. Returns the
    /// bytes the peer had acknowledged reading.
    fn finish_advert(&self) -> usize {
        let mut inner = self.inner.lock();
        let Some(mut tx) = inner.tx_sa.take() else {
            return 0;
        };
        if let Some(region) = tx.region.take() {
            if let Err(e) = self.fabric.release_region(&region) {
                debug!(ep = %self.ep, error = %e, "release of advertised region failed");
            }
        }
        tx.bytes_acked
    }

    async fn copy_rest(
        &self,
        data: &Bytes,
        offset: usize,
        flags: SendFlags,
    ) -> Result<usize, SdpError> {
        if offset < data.len() {
            self.send_copy(data.slice(offset..), flags, true).await?;
        }
        Ok(data.len())
    }
}

fn advert_outcome(inner: &mut ConnInner) -> Option<AdvertOutcome> {
    if let Some(e) = &inner.error {
        return Some(AdvertOutcome::Failed(e.clone()));
    }
    let Some(tx) = inner.tx_sa.as_mut() else {
        return Some(AdvertOutcome::Failed(SdpError::NotConnected));
    };
    if tx.is_complete() {
        return Some(AdvertOutcome::Done);
    }
    if tx.abort.contains(AbortFlags::SEND_SM) {
        return Some(AdvertOutcome::Fallback);
    }
    if tx.abort.contains(AbortFlags::CROSS_SEND) {
        return Some(AdvertOutcome::Cancel);
    }
    if inner.signal_pending {
        // The signal stays pending for the next interruptible call.
        tx.abort.insert(AbortFlags::INTERRUPTED);
        return Some(AdvertOutcome::Cancel);
    }
    None
}
