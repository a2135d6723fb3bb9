//! Per-connection state and the posting engine.
//!
//! Every transition and ring mutation happens under `Connection::inner`.
//! Blocking operations release the lock and wait on `notify`, which is
//! signalled after each batch of completions, connection-manager event,
//! timer or failure.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sdp_proto::{Capabilities, HeaderFlags, Message, BSDH_SIZE};
use sdp_verbs::{DmaMapping, EndpointId, Fabric, RecvWr, SendWr};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::SdpConfig;
use crate::credit::{wants_recv, Credits};
use crate::error::SdpError;
use crate::listener::ListenState;
use crate::moderation::Moderator;
use crate::registry::SocketRegistry;
use crate::resize::ResizeState;
use crate::ring::{OpTag, Ring, RxDesc, TxDesc, WrId};
use crate::state::TcpState;
use crate::stats::{ConnStats, SocketStats};
use crate::zcopy::{RxReadState, RxSrcAvail, TxSrcAvail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Opened with `connect`.
    Active,
    /// Derived from a listener's connect request.
    Passive,
}

/// Application data waiting for a ring slot and credits.
#[derive(Debug)]
pub(crate) enum TxItem {
    Data {
        payload: BytesMut,
        flags: HeaderFlags,
        push: bool,
    },
    /// A zero-copy advertisement. The region itself lives in `tx_sa`.
    SrcAvail { inline: Bytes },
}

impl TxItem {
    pub(crate) fn payload_len(&self) -> usize {
        match self {
            TxItem::Data { payload, .. } => payload.len(),
            TxItem::SrcAvail { inline } => inline.len(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct CtrlMsg {
    pub msg: Message,
    /// Replaces the header's ack field. Zero-copy responses carry the
    /// sequence of the advertisement they answer.
    pub ack: Option<u32>,
}

#[derive(Debug)]
pub(crate) enum RxItem {
    Data(Bytes),
    /// Stream position of the advertisement with this sequence.
    Advert(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
    Interrupted,
    TimedOut,
}

impl From<WaitError> for SdpError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Interrupted => SdpError::Interrupted,
            WaitError::TimedOut => SdpError::TimedOut,
        }
    }
}

pub(crate) struct ConnInner {
    pub state: TcpState,
    /// First error recorded; every blocked operation returns it.
    pub error: Option<SdpError>,
    /// Set on passive connections until the listener forgets them.
    pub listener: Option<Weak<ListenState>>,

    // ---- Peer parameters ----
    pub peer_caps: Capabilities,
    /// Payload bytes one peer receive buffer holds.
    pub peer_rcv_size: u32,
    /// Largest payload per DATA message.
    pub xmit_size_goal: usize,
    /// Fragments per receive buffer we post.
    pub recv_frags: u32,

    // ---- Rings and credits ----
    pub tx_ring: Ring<TxDesc>,
    pub rx_ring: Ring<RxDesc>,
    pub credits: Credits,
    /// Highest sequence received.
    pub mseq_ack: u32,

    // ---- Send side ----
    pub tx_queue: VecDeque<TxItem>,
    pub ctrl_queue: VecDeque<CtrlMsg>,
    /// Application bytes queued or posted and not yet completed.
    pub tx_bytes_queued: usize,

    // ---- Receive side ----
    pub rx_queue: VecDeque<RxItem>,
    pub rx_bytes_queued: usize,
    pub urgent: Option<u8>,

    // ---- Options ----
    pub nodelay: bool,
    pub nonblocking: bool,
    pub signal_pending: bool,
    /// Sequence of the small message still awaiting the peer's ack.
    pub nagle_last_unacked: Option<u32>,
    pub nagle_timer_armed: bool,

    // ---- Shutdown ----
    pub disconn_pending: bool,
    pub disconn_sent: bool,
    pub peer_closed: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub fabric_disconnected: bool,
    /// A flush completion was seen: the queue pair left the connected state
    /// and nothing more may be posted.
    pub flushed: bool,

    // ---- Zero-copy ----
    pub tx_sa: Option<TxSrcAvail>,
    pub rx_sa: Option<RxSrcAvail>,
    /// Sequence of the last SRCAVAIL_CANCEL received.
    pub cancel_mseq: Option<u32>,
    pub read_seq: u32,

    pub resize: ResizeState,
    pub moderator: Moderator,
    pub last_sample: Instant,
}

impl ConnInner {
    fn new(config: &SdpConfig, recv_frags: u32, state: TcpState) -> Self {
        Self {
            state,
            error: None,
            listener: None,
            peer_caps: Capabilities::empty(),
            peer_rcv_size: 0,
            xmit_size_goal: config.frag_size as usize,
            recv_frags,
            // Message sequences start at 1 so that an initial ack of 0
            // means "nothing received".
            tx_ring: Ring::new(config.tx_ring_size, 1),
            rx_ring: Ring::new(config.rx_ring_size, 0),
            credits: Credits::default(),
            mseq_ack: 0,
            tx_queue: VecDeque::new(),
            ctrl_queue: VecDeque::new(),
            tx_bytes_queued: 0,
            rx_queue: VecDeque::new(),
            rx_bytes_queued: 0,
            urgent: None,
            nodelay: config.nodelay,
            nonblocking: false,
            signal_pending: false,
            nagle_last_unacked: None,
            nagle_timer_armed: false,
            disconn_pending: false,
            disconn_sent: false,
            peer_closed: false,
            read_closed: false,
            write_closed: false,
            fabric_disconnected: false,
            flushed: false,
            tx_sa: None,
            rx_sa: None,
            cancel_mseq: None,
            read_seq: 0,
            resize: ResizeState::default(),
            moderator: Moderator::new(),
            last_sample: Instant::now(),
        }
    }

    /// Whether a deferred small DATA message at the head of the queue may go
    /// now.
    fn nagle_allows(&self, len: usize, flags: HeaderFlags, push: bool) -> bool {
        self.nodelay
            || self.nagle_last_unacked.is_none()
            // A queued tail still takes coalesced bytes; a segment with
            // another behind it cannot grow.
            || self.tx_queue.len() > 1
            || len >= self.xmit_size_goal
            || push
            || !flags.is_empty()
    }
}

/// One SDP connection (socket).
pub(crate) struct Connection {
    me: Weak<Connection>,
    pub(crate) ep: EndpointId,
    pub(crate) role: Role,
    pub(crate) fabric: Arc<dyn Fabric>,
    registry: Arc<SocketRegistry>,
    /// Snapshot taken when the connection was created.
    pub(crate) config: Arc<SdpConfig>,
    runtime: Handle,
    pub(crate) inner: Mutex<ConnInner>,
    destroyed: Mutex<bool>,
    pub(crate) notify: Notify,
    /// Serializes application sends so a write is queued atomically.
    pub(crate) send_lock: tokio::sync::Mutex<()>,
    pub(crate) stats: ConnStats,
}

impl Connection {
    pub(crate) fn new(
        ep: EndpointId,
        role: Role,
        state: TcpState,
        fabric: Arc<dyn Fabric>,
        registry: Arc<SocketRegistry>,
        config: Arc<SdpConfig>,
        runtime: Handle,
    ) -> Arc<Self> {
        let recv_frags = config.initial_recv_frags(fabric.device());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ep,
            role,
            inner: Mutex::new(ConnInner::new(&config, recv_frags, state)),
            fabric,
            registry,
            config,
            runtime,
            destroyed: Mutex::new(false),
            notify: Notify::new(),
            send_lock: tokio::sync::Mutex::new(()),
            stats: ConnStats::default(),
        })
    }

    pub(crate) fn arc(&self) -> Option<Arc<Connection>> {
        self.me.upgrade()
    }

    pub(crate) fn state(&self) -> TcpState {
        self.inner.lock().state
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.fabric.local_addr(self.ep)
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.fabric.peer_addr(self.ep)
    }

    /// Capabilities advertised in our HELLO / HELLO_ACK.
    pub(crate) fn local_caps(&self) -> Capabilities {
        if self.config.zcopy_enabled && self.fabric.device().caps.remote_read {
            Capabilities::RESIZE | Capabilities::ZCOPY
        } else {
            Capabilities::RESIZE
        }
    }

    pub(crate) fn zcopy_allowed(&self, inner: &ConnInner) -> bool {
        self.local_caps().contains(Capabilities::ZCOPY)
            && inner.peer_caps.contains(Capabilities::ZCOPY)
    }

    /// Largest message body our send sge limit can carry.
    pub(crate) fn own_send_limit(&self) -> usize {
        self.fabric.device().caps.max_send_sge as usize * self.config.frag_size as usize
    }

    /// Record the peer's handshake parameters. `bufs` is its advertised
    /// receive depth; ours is whatever we had posted when we advertised.
    pub(crate) fn init_peer(
        &self,
        inner: &mut ConnInner,
        bufs: u16,
        rcv_size: u32,
        caps: Capabilities,
    ) {
        inner.peer_caps = caps;
        inner.peer_rcv_size = rcv_size;
        inner.xmit_size_goal = (rcv_size as usize).min(self.own_send_limit()).max(1);
        inner.credits = Credits::from_handshake(bufs, inner.rx_ring.outstanding());
        debug!(
            ep = %self.ep,
            peer_bufs = bufs,
            peer_rcv_size = rcv_size,
            goal = inner.xmit_size_goal,
            zcopy = self.zcopy_allowed(inner),
            "peer parameters"
        );
    }

    pub(crate) fn set_state(&self, inner: &mut ConnInner, state: TcpState) {
        if inner.state != state {
            debug!(ep = %self.ep, from = %inner.state, to = %state, "state change");
            inner.state = state;
        }
    }

    // ------------------------------------------------------------------
    // Posting
    // ------------------------------------------------------------------

    /// Make whatever progress is possible right now: keep receives posted,
    /// post queued control and data messages, send DISCONN once the send
    /// side has drained, and re-advertise credits when the peer's view is
    /// stale.
    pub(crate) fn drive(&self, inner: &mut ConnInner) {
        let Err(err) = self.try_drive(inner) else {
            return;
        };
        match &err {
            SdpError::Fabric(e) if e.is_resource_exhaustion() => {
                trace!(ep = %self.ep, error = %err, "out of resources, retrying later");
            }
            _ if self.closing_quietly(inner) => {
                debug!(ep = %self.ep, error = %err, "post failed while closing");
            }
            _ => {
                warn!(ep = %self.ep, error = %err, "post failed, resetting connection");
                self.fail(inner, SdpError::ConnectionReset);
            }
        }
    }

    fn try_drive(&self, inner: &mut ConnInner) -> Result<(), SdpError> {
        if inner.flushed {
            return Ok(());
        }
        if inner.state.can_post_recv() {
            self.post_recvs(inner)?;
        }
        if !inner.state.can_post_send() {
            return Ok(());
        }

        if let Some(ack) = inner.resize.pending_ack {
            if ack.is_due(inner.rx_ring.tail()) {
                inner.resize.pending_ack = None;
                debug!(ep = %self.ep, granted = ack.granted_bytes, "acking resize");
                self.queue_ctrl(inner, Message::ChRcvBufAck(ack.granted_bytes), None);
            }
        }

        // DISCONN and credit updates are unrelated posts: deferred data
        // leaves ahead of them.
        let flush = inner.disconn_pending
            || (inner.state.allows_credit_update()
                && inner.credits.needs_update(inner.rx_ring.outstanding()));
        self.post_queued(inner, flush)?;

        if inner.disconn_pending
            && inner.tx_queue.is_empty()
            && inner.ctrl_queue.is_empty()
            && inner.tx_ring.is_empty()
            && inner.credits.can_post_control()
        {
            self.post_message(inner, &Message::Disconn, HeaderFlags::empty(), None)?;
            inner.disconn_pending = false;
            inner.disconn_sent = true;
            debug!(ep = %self.ep, state = %inner.state, "DISCONN sent");
        }

        if inner.state.allows_credit_update()
            && !inner.tx_ring.is_full()
            && inner.credits.needs_update(inner.rx_ring.outstanding())
        {
            self.post_message(inner, &Message::Data(Bytes::new()), HeaderFlags::empty(), None)?;
            self.stats.credit_updates.increment();
        }
        Ok(())
    }

    /// Post queued control messages, then data, while ring slots and
    /// credits allow. Data keeps `CREDIT_RESERVE` credits back.
    pub(crate) fn post_pending(&self, inner: &mut ConnInner) -> Result<(), SdpError> {
        self.post_queued(inner, false)
    }

    /// As `post_pending`; with `flush` a small message held back by Nagle
    /// goes out anyway. Posting a control message sets `flush` too.
    fn post_queued(&self, inner: &mut ConnInner, mut flush: bool) -> Result<(), SdpError> {
        while !inner.tx_ring.is_full() && inner.credits.can_post_control() {
            let Some(ctrl) = inner.ctrl_queue.pop_front() else {
                break;
            };
            if let Err(e) = self.post_message(inner, &ctrl.msg, HeaderFlags::empty(), ctrl.ack) {
                inner.ctrl_queue.push_front(ctrl);
                return Err(e);
            }
            flush = true;
        }

        while !inner.tx_ring.is_full() && inner.credits.can_post_data() {
            let head = match inner.tx_queue.front() {
                Some(TxItem::Data {
                    payload,
                    flags,
                    push,
                }) => Some((payload.len(), *flags, *push)),
                Some(TxItem::SrcAvail { .. }) => None,
                None => break,
            };
            if let Some((len, flags, push)) = head {
                if !flush && !inner.nagle_allows(len, flags, push) {
                    self.stats.nagle_deferrals.increment();
                    self.arm_nagle_timer(inner);
                    break;
                }
            }
            let Some(item) = inner.tx_queue.pop_front() else {
                break;
            };
            match item {
                TxItem::Data {
                    payload,
                    flags,
                    push,
                } => {
                    let len = payload.len();
                    let msg = Message::Data(payload.freeze());
                    match self.post_message(inner, &msg, flags, None) {
                        Ok(mseq) => {
                            if len < inner.xmit_size_goal {
                                inner.nagle_last_unacked = Some(mseq);
                            }
                        }
                        Err(e) => {
                            if let Message::Data(data) = msg {
                                inner.tx_queue.push_front(TxItem::Data {
                                    payload: BytesMut::from(&data[..]),
                                    flags,
                                    push,
                                });
                            }
                            return Err(e);
                        }
                    }
                }
                TxItem::SrcAvail { inline } => {
                    let advert = inner
                        .tx_sa
                        .as_ref()
                        .and_then(|sa| sa.region.as_ref())
                        .map(TxSrcAvail::advert);
                    let Some(advert) = advert else {
                        // The advertisement was torn down while queued.
                        inner.tx_bytes_queued = inner.tx_bytes_queued.saturating_sub(inline.len());
                        continue;
                    };
                    let msg = Message::SrcAvail { advert, inline };
                    match self.post_message(inner, &msg, HeaderFlags::empty(), None) {
                        Ok(mseq) => {
                            if let Some(sa) = inner.tx_sa.as_mut() {
                                sa.mseq = Some(mseq);
                            }
                            debug!(ep = %self.ep, mseq, len = advert.len, "SRC_AVAIL posted");
                        }
                        Err(e) => {
                            if let Message::SrcAvail { inline, .. } = msg {
                                inner.tx_queue.push_front(TxItem::SrcAvail { inline });
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Encode and post one message. Its sequence is the tx ring head; the
    /// header advertises our current posted receive depth.
    pub(crate) fn post_message(
        &self,
        inner: &mut ConnInner,
        msg: &Message,
        flags: HeaderFlags,
        ack: Option<u32>,
    ) -> Result<u32, SdpError> {
        let mseq = inner.tx_ring.head();
        let posted = inner.rx_ring.outstanding();
        let bufs = posted.min(u16::MAX as u32) as u16;
        let mseq_ack = ack.unwrap_or(inner.mseq_ack);
        let data = msg.encode(flags, bufs, mseq, mseq_ack);

        let body_len = msg.body_len();
        let num_sge = body_len.div_ceil(self.config.frag_size as usize).max(1) as u32;
        let mappings = self.map_fragments(body_len, num_sge)?;
        let wr = SendWr {
            wr_id: WrId::new(OpTag::Send, mseq).raw(),
            data,
            num_sge,
        };
        if let Err(e) = self.fabric.post_send(self.ep, wr) {
            self.unmap_all(mappings);
            return Err(e.into());
        }

        let payload_len = msg.payload_len();
        inner.tx_ring.push(TxDesc {
            mseq,
            mid: msg.mid(),
            payload_len,
            mappings,
        })?;
        inner.credits.on_post(posted);
        self.stats.tx_packets.increment();
        self.stats.tx_bytes.add(payload_len as u64);
        trace!(
            ep = %self.ep,
            mid = ?msg.mid(),
            mseq,
            mseq_ack,
            bufs,
            len = body_len,
            credits = inner.credits.tx_credits,
            "posted"
        );
        Ok(mseq)
    }

    pub(crate) fn queue_ctrl(&self, inner: &mut ConnInner, msg: Message, ack: Option<u32>) {
        inner.ctrl_queue.push_back(CtrlMsg { msg, ack });
    }

    /// Keep receive buffers posted up to the ring size and the receive
    /// buffer budget.
    pub(crate) fn post_recvs(&self, inner: &mut ConnInner) -> Result<(), SdpError> {
        let frags = inner.recv_frags;
        let capacity = self.config.recv_buf_capacity(frags);
        while wants_recv(
            inner.rx_ring.outstanding(),
            inner.rx_ring.capacity(),
            inner.rx_bytes_queued,
            capacity,
            self.config.rcvbuf,
        ) {
            let mappings =
                self.map_fragments(frags as usize * self.config.frag_size as usize, frags)?;
            let seq = inner.rx_ring.head();
            let wr = RecvWr {
                wr_id: WrId::new(OpTag::Recv, seq).raw(),
                capacity,
                num_sge: frags,
            };
            if let Err(e) = self.fabric.post_receive(self.ep, wr) {
                self.unmap_all(mappings);
                return Err(e.into());
            }
            inner.rx_ring.push(RxDesc { mappings, capacity })?;
        }
        Ok(())
    }

    /// One mapping per fragment of a `body_len` message; the first also
    /// covers the header.
    fn map_fragments(&self, body_len: usize, count: u32) -> Result<Vec<DmaMapping>, SdpError> {
        let frag = self.config.frag_size as usize;
        let mut remaining = body_len;
        let mut mappings = Vec::with_capacity(count as usize);
        for i in 0..count {
            let mut len = remaining.min(frag);
            remaining -= len;
            if i == 0 {
                len += BSDH_SIZE;
            }
            match self.fabric.dma_map(len) {
                Ok(m) => mappings.push(m),
                Err(e) => {
                    self.unmap_all(mappings);
                    return Err(e.into());
                }
            }
        }
        Ok(mappings)
    }

    pub(crate) fn unmap_all(&self, mappings: Vec<DmaMapping>) {
        for m in mappings {
            self.fabric.dma_unmap(m);
        }
    }

    // ------------------------------------------------------------------
    // Failure and teardown
    // ------------------------------------------------------------------

    /// Record `err` (the first one wins), wake every waiter and schedule
    /// teardown.
    pub(crate) fn fail(&self, inner: &mut ConnInner, err: SdpError) {
        if inner.error.is_none() {
            debug!(ep = %self.ep, state = %inner.state, error = %err, "connection failed");
            inner.error = Some(err);
        }
        self.set_state(inner, TcpState::Close);
        self.notify.notify_waiters();
        self.schedule_destroy();
    }

    pub(crate) fn reset(&self, err: SdpError) {
        let mut inner = self.inner.lock();
        self.fail(&mut inner, err);
    }

    fn schedule_destroy(&self) {
        if let Some(conn) = self.arc() {
            self.runtime.spawn(async move { conn.destroy() });
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        *self.destroyed.lock()
    }

    /// Release every resource the connection holds. Safe to call from any
    /// number of triggers; only the first does anything.
    pub(crate) fn destroy(&self) {
        {
            let mut destroyed = self.destroyed.lock();
            if *destroyed {
                return;
            }
            *destroyed = true;
        }

        let listener = {
            let mut inner = self.inner.lock();
            self.set_state(&mut inner, TcpState::Close);
            for desc in inner.tx_ring.drain() {
                self.unmap_all(desc.mappings);
            }
            for desc in inner.rx_ring.drain() {
                self.unmap_all(desc.mappings);
            }
            if let Some(region) = inner.tx_sa.take().and_then(|mut sa| sa.region.take()) {
                if let Err(e) = self.fabric.release_region(&region) {
                    debug!(ep = %self.ep, error = %e, "release of advertised region failed");
                }
            }
            if let Some(rx) = inner.rx_sa.take() {
                if let RxReadState::ReadInflight { sink, .. } = rx.state {
                    if let Err(e) = self.fabric.release_region(&sink) {
                        debug!(ep = %self.ep, error = %e, "release of read sink failed");
                    }
                }
            }
            inner.tx_queue.clear();
            inner.ctrl_queue.clear();
            inner.tx_bytes_queued = 0;
            // Received data stays readable.
            inner.rx_queue.retain(|item| matches!(item, RxItem::Data(_)));
            inner.listener.take()
        };

        self.fabric.destroy_endpoint(self.ep);
        self.registry.remove(self.ep);
        if let Some(ls) = listener.and_then(|w| w.upgrade()) {
            ls.remove(self.ep);
        }
        self.notify.notify_waiters();
        debug!(ep = %self.ep, "connection destroyed");
    }

    /// Failed work is expected while tearing down; it is released silently.
    pub(crate) fn closing_quietly(&self, inner: &ConnInner) -> bool {
        inner.state.is_closing() || inner.error.is_some() || self.is_destroyed()
    }

    pub(crate) fn enter_time_wait(&self, inner: &mut ConnInner) {
        self.set_state(inner, TcpState::TimeWait);
        if !inner.fabric_disconnected {
            inner.fabric_disconnected = true;
            if let Err(e) = self.fabric.disconnect(self.ep) {
                warn!(ep = %self.ep, error = %e, "fabric disconnect failed");
                self.schedule_destroy();
            }
        }
        self.notify.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run `f` under the connection lock after `delay`, unless the
    /// connection is gone by then.
    fn spawn_after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce(&Connection, &mut ConnInner) + Send + 'static,
    {
        let weak = self.me.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if conn.is_destroyed() {
                return;
            }
            let mut inner = conn.inner.lock();
            f(&conn, &mut inner);
        });
    }

    pub(crate) fn arm_nagle_timer(&self, inner: &mut ConnInner) {
        if inner.nagle_timer_armed {
            return;
        }
        inner.nagle_timer_armed = true;
        self.spawn_after(self.config.nagle_timeout(), |conn, inner| {
            inner.nagle_timer_armed = false;
            inner.nagle_last_unacked = None;
            conn.drive(inner);
            conn.notify.notify_waiters();
        });
    }

    fn arm_fin_wait_guard(&self) {
        self.spawn_after(self.config.fin_wait_timeout(), |conn, inner| {
            if inner.state.awaits_disconnect() {
                warn!(ep = %conn.ep, state = %inner.state, "disconnect handshake timed out");
                conn.enter_time_wait(inner);
            }
        });
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    /// Block until `check` yields a value. Completions are reaped inline
    /// before every check. An interruptible wait consumes a pending
    /// `interrupt()`.
    pub(crate) async fn wait_for<T, F>(
        &self,
        deadline: Option<Instant>,
        interruptible: bool,
        mut check: F,
    ) -> Result<T, WaitError>
    where
        T: Send,
        F: FnMut(&mut ConnInner) -> Option<T> + Send,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                self.poll_locked(&mut inner);
                if let Some(v) = check(&mut *inner) {
                    return Ok(v);
                }
                if interruptible && inner.signal_pending {
                    inner.signal_pending = false;
                    return Err(WaitError::Interrupted);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let mut inner = self.inner.lock();
                        self.poll_locked(&mut inner);
                        return check(&mut *inner).ok_or(WaitError::TimedOut);
                    }
                }
                None => notified.await,
            }
        }
    }

    // ------------------------------------------------------------------
    // Socket controls
    // ------------------------------------------------------------------

    /// Close both directions. Unread data is discarded and an advertisement
    /// we will never read is declined.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.read_closed {
            inner.read_closed = true;
            inner.rx_queue.clear();
            inner.rx_bytes_queued = 0;
            let pending = inner.rx_sa.as_mut().map(|rx| {
                if rx.is_read_inflight() {
                    rx.cancelled = true;
                    None
                } else {
                    Some(rx.mseq)
                }
            });
            if let Some(Some(mseq)) = pending {
                inner.rx_sa = None;
                self.queue_ctrl(&mut inner, Message::SendSm, Some(mseq));
            }
        }
        self.begin_shutdown(&mut inner);
    }

    /// Half-close: no more sends, the socket stays readable.
    pub(crate) fn shutdown_write(&self) {
        let mut inner = self.inner.lock();
        self.begin_shutdown(&mut inner);
    }

    fn begin_shutdown(&self, inner: &mut ConnInner) {
        match inner.state {
            TcpState::Established => {
                self.set_state(inner, TcpState::FinWait1);
                inner.disconn_pending = true;
                self.arm_fin_wait_guard();
            }
            TcpState::CloseWait => {
                self.set_state(inner, TcpState::LastAck);
                inner.disconn_pending = true;
                self.arm_fin_wait_guard();
            }
            TcpState::SynSent | TcpState::SynRecv => {
                self.set_state(inner, TcpState::Close);
                self.schedule_destroy();
            }
            _ => {}
        }
        inner.write_closed = true;
        self.drive(inner);
        self.notify.notify_waiters();
    }

    /// Abortive close: post ABORT if possible and reset locally.
    pub(crate) fn abort(&self) {
        let mut inner = self.inner.lock();
        if inner.state.can_post_send()
            && !inner.flushed
            && !inner.tx_ring.is_full()
            && inner.credits.can_post_control()
        {
            if let Err(e) = self.post_message(&mut inner, &Message::Abort, HeaderFlags::empty(), None)
            {
                debug!(ep = %self.ep, error = %e, "ABORT not sent");
            }
        }
        self.fail(&mut inner, SdpError::ConnectionReset);
    }

    /// Wake the current (or next) interruptible wait with `Interrupted`.
    pub(crate) fn interrupt(&self) {
        self.inner.lock().signal_pending = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn set_nodelay(&self, nodelay: bool) {
        let mut inner = self.inner.lock();
        inner.nodelay = nodelay;
        if nodelay {
            self.drive(&mut inner);
        }
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) {
        self.inner.lock().nonblocking = nonblocking;
        self.notify.notify_waiters();
    }

    /// Ask the peer to grow its receive buffers to `frags` fragments.
    pub(crate) fn request_resize(&self, frags: u32) -> Result<(), SdpError> {
        let mut inner = self.inner.lock();
        self.check_writable(&inner)?;
        if !inner.peer_caps.contains(Capabilities::RESIZE) {
            return Err(SdpError::InvalidArgument(
                "peer does not support resize".into(),
            ));
        }
        if frags == 0 {
            return Err(SdpError::InvalidArgument("zero fragments".into()));
        }
        if inner.resize.request_outstanding {
            return Err(SdpError::WouldBlock);
        }
        let bytes = frags.saturating_mul(self.config.frag_size);
        inner.resize.request_outstanding = true;
        debug!(ep = %self.ep, frags, bytes, "requesting resize");
        self.queue_ctrl(&mut inner, Message::ChRcvBuf(bytes), None);
        self.drive(&mut inner);
        Ok(())
    }

    pub(crate) fn check_writable(&self, inner: &ConnInner) -> Result<(), SdpError> {
        if let Some(e) = &inner.error {
            return Err(e.clone());
        }
        if inner.write_closed || !inner.state.can_send() {
            return Err(SdpError::NotConnected);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub(crate) fn stats_snapshot(&self) -> SocketStats {
        let inner = self.inner.lock();
        let s = &self.stats;
        SocketStats {
            state: inner.state,
            tx_credits: inner.credits.tx_credits,
            remote_credits: inner.credits.remote_credits,
            posted_recvs: inner.rx_ring.outstanding(),
            tx_outstanding: inner.tx_ring.outstanding(),
            recv_frags: inner.recv_frags,
            xmit_size_goal: inner.xmit_size_goal,
            tx_bytes_queued: inner.tx_bytes_queued,
            rx_bytes_queued: inner.rx_bytes_queued,
            tx_packets: s.tx_packets.get(),
            rx_packets: s.rx_packets.get(),
            tx_bytes: s.tx_bytes.get(),
            rx_bytes: s.rx_bytes.get(),
            credit_updates: s.credit_updates.get(),
            nagle_deferrals: s.nagle_deferrals.get(),
            zcopy_sends: s.zcopy_sends.get(),
            zcopy_fallbacks: s.zcopy_fallbacks.get(),
            zcopy_cancels: s.zcopy_cancels.get(),
            zcopy_declined: s.zcopy_declined.get(),
            rdma_read_bytes: s.rdma_read_bytes.get(),
            stale_zcopy_responses: s.stale_zcopy_responses.get(),
        }
    }

    /// Feed the moderation sampler; `cfg` is the live configuration so that
    /// hot-updated bounds apply to existing connections.
    pub(crate) fn sample_moderation(&self, cfg: &SdpConfig, now: Instant) {
        let mut inner = self.inner.lock();
        if !inner.state.can_post_send() {
            return;
        }
        let elapsed = now.saturating_duration_since(inner.last_sample);
        if elapsed < cfg.moderation_sample() {
            return;
        }
        inner.last_sample = now;
        let tx = self.stats.tx_packets.get();
        let rx = self.stats.rx_packets.get();
        if let Some((count, usec)) = inner.moderator.sample(cfg, tx, rx, elapsed) {
            match self.fabric.set_cq_moderation(self.ep, count, usec) {
                Ok(()) => debug!(
                    ep = %self.ep,
                    count,
                    usec,
                    rate = inner.moderator.avg_rate(),
                    "cq moderation updated"
                ),
                Err(e) => debug!(ep = %self.ep, error = %e, "cq moderation not applied"),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sdp_verbs::{DeviceCaps, LoopbackDevice, LoopbackNetwork};

    pub(crate) fn device() -> Arc<LoopbackDevice> {
        let net = LoopbackNetwork::new();
        net.add_device("lo0", "10.0.0.1".parse().unwrap(), DeviceCaps::default())
    }

    pub(crate) fn connection(dev: &Arc<LoopbackDevice>, state: TcpState) -> Arc<Connection> {
        let ep = dev.create_endpoint().unwrap();
        let config = SdpConfig::default();
        dev.create_qp(ep, config.qp_caps(dev.device())).unwrap();
        let conn = Connection::new(
            ep,
            Role::Active,
            state,
            dev.clone(),
            Arc::new(SocketRegistry::new()),
            Arc::new(config),
            Handle::current(),
        );
        conn.registry
            .insert(ep, crate::registry::Registered::Socket(conn.clone()))
            .unwrap();
        conn
    }

    pub(crate) fn inner_for_test(config: &SdpConfig) -> ConnInner {
        ConnInner::new(config, config.recv_frags, TcpState::Established)
    }

    pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_nagle_predicate() {
        let cfg = SdpConfig::default();
        let mut inner = ConnInner::new(&cfg, 16, TcpState::Established);
        inner.xmit_size_goal = 1000;
        assert!(inner.nagle_allows(10, HeaderFlags::empty(), false));
        inner.nagle_last_unacked = Some(3);
        assert!(!inner.nagle_allows(10, HeaderFlags::empty(), false));
        assert!(inner.nagle_allows(1000, HeaderFlags::empty(), false));
        assert!(inner.nagle_allows(10, HeaderFlags::empty(), true));
        assert!(inner.nagle_allows(10, HeaderFlags::OOB_PEND, false));
        inner.nodelay = true;
        assert!(inner.nagle_allows(10, HeaderFlags::empty(), false));
    }

    #[test]
    fn test_initial_sequences() {
        let cfg = SdpConfig::default();
        let inner = ConnInner::new(&cfg, 16, TcpState::SynSent);
        assert_eq!(inner.tx_ring.head(), 1);
        assert_eq!(inner.mseq_ack, 0);
        assert_eq!(inner.xmit_size_goal, 4096);
    }

    #[tokio::test]
    async fn test_interrupt_wakes_waiter() {
        let dev = device();
        let conn = connection(&dev, TcpState::SynSent);
        let c = conn.clone();
        let waiter = tokio::spawn(async move { c.wait_for(None, true, |_| None::<()>).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.interrupt();
        assert_eq!(waiter.await.unwrap(), Err(WaitError::Interrupted));
        assert!(!conn.inner.lock().signal_pending);
    }

    #[tokio::test]
    async fn test_uninterruptible_wait_keeps_signal() {
        let dev = device();
        let conn = connection(&dev, TcpState::SynSent);
        conn.interrupt();
        let deadline = Instant::now() + Duration::from_millis(20);
        let res = conn.wait_for(Some(deadline), false, |_| None::<()>).await;
        assert_eq!(res, Err(WaitError::TimedOut));
        assert!(conn.inner.lock().signal_pending);
    }

    #[tokio::test]
    async fn test_fail_destroys_once() {
        let dev = device();
        let conn = connection(&dev, TcpState::SynSent);
        assert_eq!(dev.live_endpoints(), 1);
        conn.reset(SdpError::ConnectionReset);
        conn.reset(SdpError::TimedOut);
        eventually(|| conn.is_destroyed()).await;
        assert_eq!(dev.live_endpoints(), 0);
        assert!(conn.registry.is_empty());
        let inner = conn.inner.lock();
        assert_eq!(inner.state, TcpState::Close);
        assert_eq!(inner.error, Some(SdpError::ConnectionReset));
        drop(inner);
        conn.destroy();
        assert_eq!(dev.unknown_unmaps(), 0);
    }

    #[tokio::test]
    async fn test_close_while_connecting_destroys() {
        let dev = device();
        let conn = connection(&dev, TcpState::SynSent);
        conn.close();
        eventually(|| conn.is_destroyed()).await;
        assert_eq!(conn.state(), TcpState::Close);
        assert!(conn.inner.lock().error.is_none());
    }

    #[tokio::test]
    async fn test_request_resize_requires_connection() {
        let dev = device();
        let conn = connection(&dev, TcpState::SynSent);
        assert_eq!(conn.request_resize(32), Err(SdpError::NotConnected));
    }
}
