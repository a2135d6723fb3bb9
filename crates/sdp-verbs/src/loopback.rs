//! In-memory fabric.
//!
//! A [`LoopbackNetwork`] connects any number of [`LoopbackDevice`]s, each
//! bound to one IP address. Sends are delivered to the peer's posted
//! receives (or queued receiver-not-ready until one is posted), remote reads
//! are served from the peer device's registered regions, and
//! connection-manager transitions produce the same event sequence the real
//! connection manager does.
//!
//! Test hooks allow holding message delivery and send completions so that
//! interleavings can be forced deterministically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buf::{AccessFlags, DmaMapping, RegionHandle};
use crate::device::{DeviceCaps, DeviceInfo, LinkLayer};
use crate::error::FabricError;
use crate::fabric::{
    CmEvent, CqKind, EndpointId, EventSender, Fabric, FabricEvent, QpCaps, ReadWr, RecvWr,
    SendWr, WcOpcode, WcStatus, WorkCompletion,
};

const EPHEMERAL_PORT_BASE: u16 = 40000;
const REGION_ALIGN: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpStatus {
    Idle,
    Listening,
    AddrResolved,
    Connecting,
    Connected,
    Disconnected,
}

struct EpState {
    device: u8,
    status: EpStatus,
    qp: Option<QpCaps>,
    local: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    peer: Option<EndpointId>,
    recv_posted: VecDeque<RecvWr>,
    /// Messages that arrived while no receive was posted.
    rnr: VecDeque<Bytes>,
    send_cq: VecDeque<WorkCompletion>,
    recv_cq: VecDeque<WorkCompletion>,
    send_armed: bool,
    recv_armed: bool,
    sends_outstanding: u32,
    held_send_wcs: Vec<WorkCompletion>,
    timewait_sent: bool,
    moderation: Option<(u16, u16)>,
}

impl EpState {
    fn new(device: u8) -> Self {
        Self {
            device,
            status: EpStatus::Idle,
            qp: None,
            local: None,
            dst: None,
            peer: None,
            recv_posted: VecDeque::new(),
            rnr: VecDeque::new(),
            send_cq: VecDeque::new(),
            recv_cq: VecDeque::new(),
            send_armed: true,
            recv_armed: true,
            sends_outstanding: 0,
            held_send_wcs: Vec::new(),
            timewait_sent: false,
            moderation: None,
        }
    }
}

struct Region {
    handle: RegionHandle,
    data: Bytes,
}

struct DevState {
    ip: IpAddr,
    sink: Option<EventSender>,
    removed: bool,
    next_port: u16,
    /// Registered regions keyed by rkey.
    regions: HashMap<u32, Region>,
    mappings: HashSet<u64>,
    unknown_unmaps: u64,
    unknown_releases: u64,
    hold_send_completions: bool,
}

#[derive(Default)]
struct NetState {
    next_id: u64,
    next_key: u32,
    next_vaddr: u64,
    devices: HashMap<u8, DevState>,
    endpoints: HashMap<EndpointId, EpState>,
    listeners: HashMap<SocketAddr, EndpointId>,
    hold_delivery: bool,
    held: VecDeque<(EndpointId, Bytes)>,
    /// Kept after the endpoint is destroyed so teardown can be audited.
    disconnect_calls: HashMap<EndpointId, u32>,
    /// Events produced by the current operation, dispatched before the lock
    /// is released.
    pending: Vec<(u8, FabricEvent)>,
}

impl NetState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn alloc_vaddr(&mut self, len: u64) -> u64 {
        if self.next_vaddr == 0 {
            self.next_vaddr = 0x1000_0000;
        }
        let addr = self.next_vaddr;
        self.next_vaddr += len.div_ceil(REGION_ALIGN).max(1) * REGION_ALIGN;
        addr
    }

    fn ep(&mut self, id: EndpointId) -> Result<&mut EpState, FabricError> {
        self.endpoints
            .get_mut(&id)
            .ok_or(FabricError::UnknownEndpoint(id))
    }

    fn emit(&mut self, id: EndpointId, event: CmEvent) {
        if let Some(ep) = self.endpoints.get(&id) {
            self.pending.push((
                ep.device,
                FabricEvent::Cm {
                    endpoint: id,
                    event,
                },
            ));
        }
    }

    fn emit_on(&mut self, device: u8, id: EndpointId, event: CmEvent) {
        self.pending.push((
            device,
            FabricEvent::Cm {
                endpoint: id,
                event,
            },
        ));
    }

    fn dispatch(&mut self) {
        for (device, event) in self.pending.drain(..) {
            let Some(dev) = self.devices.get(&device) else {
                continue;
            };
            match &dev.sink {
                Some(sink) => {
                    if sink.send(event).is_err() {
                        tracing::trace!(device, "event sink closed, dropping event");
                    }
                }
                None => tracing::trace!(device, ?event, "no event sink installed"),
            }
        }
    }

    fn push_completion(&mut self, id: EndpointId, cq: CqKind, wc: WorkCompletion) {
        let Some(ep) = self.endpoints.get_mut(&id) else {
            return;
        };
        let (queue, armed) = match cq {
            CqKind::Send => (&mut ep.send_cq, &mut ep.send_armed),
            CqKind::Recv => (&mut ep.recv_cq, &mut ep.recv_armed),
        };
        queue.push_back(wc);
        if *armed {
            *armed = false;
            self.pending
                .push((ep.device, FabricEvent::Completion { endpoint: id, cq }));
        }
    }

    /// Hand `data` to `dst`'s oldest posted receive.
    fn deliver(&mut self, dst: EndpointId, data: Bytes) {
        let Some(ep) = self.endpoints.get_mut(&dst) else {
            return;
        };
        if ep.status != EpStatus::Connected {
            tracing::trace!(%dst, "dropping message for unconnected endpoint");
            return;
        }
        if !ep.rnr.is_empty() {
            ep.rnr.push_back(data);
            return;
        }
        match ep.recv_posted.pop_front() {
            Some(wr) => self.complete_recv(dst, wr, data),
            None => ep.rnr.push_back(data),
        }
    }

    fn complete_recv(&mut self, id: EndpointId, wr: RecvWr, data: Bytes) {
        let wc = if data.len() > wr.capacity {
            WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::LocalLengthError,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                data: None,
            }
        } else {
            WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::Success,
                opcode: WcOpcode::Recv,
                byte_len: data.len() as u32,
                data: Some(data),
            }
        };
        self.push_completion(id, CqKind::Recv, wc);
    }

    fn drain_rnr(&mut self, id: EndpointId) {
        loop {
            let Some(ep) = self.endpoints.get_mut(&id) else {
                return;
            };
            if ep.rnr.is_empty() || ep.recv_posted.is_empty() {
                return;
            }
            let (Some(data), Some(wr)) = (ep.rnr.pop_front(), ep.recv_posted.pop_front()) else {
                return;
            };
            self.complete_recv(id, wr, data);
        }
    }

    /// Move the endpoint out of the connected state, flushing posted receives.
    fn break_connection(&mut self, id: EndpointId) {
        let flushed: Vec<RecvWr> = match self.endpoints.get_mut(&id) {
            Some(ep) => {
                ep.status = EpStatus::Disconnected;
                ep.rnr.clear();
                ep.recv_posted.drain(..).collect()
            }
            None => return,
        };
        for wr in flushed {
            self.push_completion(
                id,
                CqKind::Recv,
                WorkCompletion {
                    wr_id: wr.wr_id,
                    status: WcStatus::WrFlushError,
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                    data: None,
                },
            );
        }
    }

    fn timewait_exit(&mut self, id: EndpointId) {
        if let Some(ep) = self.endpoints.get_mut(&id) {
            if !ep.timewait_sent {
                ep.timewait_sent = true;
                self.emit(id, CmEvent::TimewaitExit);
            }
        }
    }

    fn ephemeral_addr(&mut self, device: u8) -> Option<SocketAddr> {
        let dev = self.devices.get_mut(&device)?;
        let port = dev.next_port;
        dev.next_port = dev.next_port.wrapping_add(1).max(EPHEMERAL_PORT_BASE);
        Some(SocketAddr::new(dev.ip, port))
    }
}

/// A set of loopback devices that can reach each other.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device bound to `ip`.
    pub fn add_device(
        &self,
        name: impl Into<String>,
        ip: IpAddr,
        caps: DeviceCaps,
    ) -> Arc<LoopbackDevice> {
        let mut st = self.state.lock();
        let id = st.devices.len() as u8;
        st.devices.insert(
            id,
            DevState {
                ip,
                sink: None,
                removed: false,
                next_port: EPHEMERAL_PORT_BASE,
                regions: HashMap::new(),
                mappings: HashSet::new(),
                unknown_unmaps: 0,
                unknown_releases: 0,
                hold_send_completions: false,
            },
        );
        Arc::new(LoopbackDevice {
            id,
            info: DeviceInfo::new(id, name, LinkLayer::Loopback, caps),
            net: self.clone(),
        })
    }

    /// Queue sent messages instead of delivering them.
    pub fn hold_delivery(&self, hold: bool) {
        self.state.lock().hold_delivery = hold;
    }

    /// Deliver all held messages in the order they were sent.
    pub fn release_delivery(&self) {
        let mut st = self.state.lock();
        st.hold_delivery = false;
        while let Some((dst, data)) = st.held.pop_front() {
            st.deliver(dst, data);
        }
        st.dispatch();
    }

    pub fn held_messages(&self) -> usize {
        self.state.lock().held.len()
    }
}

/// One host's view of a [`LoopbackNetwork`].
pub struct LoopbackDevice {
    id: u8,
    info: DeviceInfo,
    net: LoopbackNetwork,
}

impl LoopbackDevice {
    /// Withhold send completions (the peer still receives the messages).
    pub fn hold_send_completions(&self, hold: bool) {
        let mut st = self.net.state.lock();
        if let Some(dev) = st.devices.get_mut(&self.id) {
            dev.hold_send_completions = hold;
        }
    }

    /// Surface all withheld send completions.
    pub fn release_send_completions(&self) {
        let mut st = self.net.state.lock();
        if let Some(dev) = st.devices.get_mut(&self.id) {
            dev.hold_send_completions = false;
        }
        let mut held = Vec::new();
        for (id, ep) in st.endpoints.iter_mut() {
            if ep.device == self.id {
                for wc in ep.held_send_wcs.drain(..) {
                    held.push((*id, wc));
                }
            }
        }
        for (id, wc) in held {
            st.push_completion(id, CqKind::Send, wc);
        }
        st.dispatch();
    }

    /// Simulate hot removal of the device.
    pub fn remove(&self) {
        let mut st = self.net.state.lock();
        if let Some(dev) = st.devices.get_mut(&self.id) {
            dev.removed = true;
        }
        let ids: Vec<EndpointId> = st
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.device == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            st.emit(id, CmEvent::DeviceRemoval);
        }
        st.dispatch();
    }

    /// Registered regions not yet released.
    pub fn live_regions(&self) -> usize {
        let st = self.net.state.lock();
        st.devices.get(&self.id).map_or(0, |d| d.regions.len())
    }

    /// DMA mappings not yet unmapped.
    pub fn live_mappings(&self) -> usize {
        let st = self.net.state.lock();
        st.devices.get(&self.id).map_or(0, |d| d.mappings.len())
    }

    /// Unmap calls for mappings that were not live.
    pub fn unknown_unmaps(&self) -> u64 {
        let st = self.net.state.lock();
        st.devices.get(&self.id).map_or(0, |d| d.unknown_unmaps)
    }

    /// Release calls for regions that were not registered.
    pub fn unknown_releases(&self) -> u64 {
        let st = self.net.state.lock();
        st.devices.get(&self.id).map_or(0, |d| d.unknown_releases)
    }

    /// Disconnect calls made on `ep`, including after it was destroyed.
    pub fn disconnect_calls(&self, ep: EndpointId) -> u32 {
        let st = self.net.state.lock();
        st.disconnect_calls.get(&ep).copied().unwrap_or(0)
    }

    pub fn moderation(&self, ep: EndpointId) -> Option<(u16, u16)> {
        let st = self.net.state.lock();
        st.endpoints.get(&ep).and_then(|e| e.moderation)
    }

    pub fn posted_receives(&self, ep: EndpointId) -> usize {
        let st = self.net.state.lock();
        st.endpoints.get(&ep).map_or(0, |e| e.recv_posted.len())
    }

    /// Endpoints on this device that have not been destroyed.
    pub fn live_endpoints(&self) -> usize {
        let st = self.net.state.lock();
        st.endpoints.values().filter(|e| e.device == self.id).count()
    }

    fn check_present(&self, st: &NetState) -> Result<(), FabricError> {
        match st.devices.get(&self.id) {
            Some(dev) if !dev.removed => Ok(()),
            _ => Err(FabricError::DeviceRemoved),
        }
    }
}

impl Fabric for LoopbackDevice {
    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn set_event_sink(&self, sink: EventSender) {
        let mut st = self.net.state.lock();
        if let Some(dev) = st.devices.get_mut(&self.id) {
            dev.sink = Some(sink);
        }
    }

    fn create_endpoint(&self) -> Result<EndpointId, FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let id = EndpointId(st.alloc_id());
        st.endpoints.insert(id, EpState::new(self.id));
        Ok(id)
    }

    fn create_qp(&self, ep: EndpointId, caps: QpCaps) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let dev = self.info.caps;
        if caps.max_send_wr > dev.max_qp_wr
            || caps.max_recv_wr > dev.max_qp_wr
            || caps.max_send_sge > dev.max_send_sge
            || caps.max_recv_sge > dev.max_recv_sge
        {
            return Err(FabricError::InvalidState(format!(
                "queue pair caps {caps:?} exceed device limits"
            )));
        }
        st.ep(ep)?.qp = Some(caps);
        Ok(())
    }

    fn destroy_endpoint(&self, ep: EndpointId) {
        let mut st = self.net.state.lock();
        let Some(state) = st.endpoints.remove(&ep) else {
            return;
        };
        if state.status == EpStatus::Listening {
            st.listeners.retain(|_, id| *id != ep);
        }
        if let Some(peer) = state.peer {
            let peer_status = st.endpoints.get(&peer).map(|p| p.status);
            match peer_status {
                Some(EpStatus::Connected) => {
                    st.break_connection(peer);
                    st.emit(peer, CmEvent::Disconnected);
                }
                Some(EpStatus::Connecting) => {
                    if let Some(p) = st.endpoints.get_mut(&peer) {
                        p.status = EpStatus::Idle;
                        p.peer = None;
                    }
                    st.emit(peer, CmEvent::Rejected);
                }
                _ => {}
            }
        }
        tracing::trace!(%ep, "endpoint destroyed");
        st.dispatch();
    }

    fn listen(&self, ep: EndpointId, addr: SocketAddr) -> Result<SocketAddr, FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let mut bound = addr;
        if bound.ip().is_unspecified() {
            if let Some(dev) = st.devices.get(&self.id) {
                bound.set_ip(dev.ip);
            }
        }
        if bound.port() == 0 {
            bound = st
                .ephemeral_addr(self.id)
                .ok_or(FabricError::DeviceRemoved)?;
        }
        if st.listeners.contains_key(&bound) {
            return Err(FabricError::AddrInUse(bound));
        }
        let state = st.ep(ep)?;
        if state.status != EpStatus::Idle {
            return Err(FabricError::InvalidState("listen on a used endpoint".into()));
        }
        state.status = EpStatus::Listening;
        state.local = Some(bound);
        st.listeners.insert(bound, ep);
        tracing::debug!(%ep, %bound, "listening");
        Ok(bound)
    }

    fn resolve_addr(&self, ep: EndpointId, dst: SocketAddr) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let reachable = st.devices.values().any(|d| d.ip == dst.ip() && !d.removed);
        let local = st.ephemeral_addr(self.id);
        let state = st.ep(ep)?;
        if reachable {
            state.status = EpStatus::AddrResolved;
            state.dst = Some(dst);
            state.local = local;
            st.emit(ep, CmEvent::AddrResolved);
        } else {
            st.emit(ep, CmEvent::AddrError);
        }
        st.dispatch();
        Ok(())
    }

    fn resolve_route(&self, ep: EndpointId) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        if st.ep(ep)?.status != EpStatus::AddrResolved {
            return Err(FabricError::InvalidState("route before address".into()));
        }
        st.emit(ep, CmEvent::RouteResolved);
        st.dispatch();
        Ok(())
    }

    fn connect(&self, ep: EndpointId, private_data: Bytes) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let state = st.ep(ep)?;
        if state.status != EpStatus::AddrResolved {
            return Err(FabricError::InvalidState("connect before resolution".into()));
        }
        let (Some(dst), Some(local)) = (state.dst, state.local) else {
            return Err(FabricError::InvalidState("connect before resolution".into()));
        };
        state.status = EpStatus::Connecting;

        let listener = st.listeners.get(&dst).copied();
        let Some(listener) = listener else {
            tracing::debug!(%ep, %dst, "no listener, rejecting");
            if let Some(s) = st.endpoints.get_mut(&ep) {
                s.status = EpStatus::Idle;
            }
            st.emit(ep, CmEvent::Rejected);
            st.dispatch();
            return Ok(());
        };
        let listener_dev = match st.endpoints.get(&listener) {
            Some(l) => l.device,
            None => return Err(FabricError::UnknownEndpoint(listener)),
        };
        if st.devices.get(&listener_dev).map_or(true, |d| d.removed) {
            st.emit(ep, CmEvent::Unreachable);
            st.dispatch();
            return Ok(());
        }

        let child = EndpointId(st.alloc_id());
        let mut child_state = EpState::new(listener_dev);
        child_state.status = EpStatus::Connecting;
        child_state.local = Some(dst);
        child_state.dst = Some(local);
        child_state.peer = Some(ep);
        st.endpoints.insert(child, child_state);
        if let Some(s) = st.endpoints.get_mut(&ep) {
            s.peer = Some(child);
        }
        st.emit_on(
            listener_dev,
            listener,
            CmEvent::ConnectRequest {
                child,
                private_data,
                peer: local,
            },
        );
        st.dispatch();
        Ok(())
    }

    fn accept(&self, ep: EndpointId, private_data: Bytes) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let state = st.ep(ep)?;
        if state.status != EpStatus::Connecting || state.qp.is_none() {
            return Err(FabricError::InvalidState("accept without request".into()));
        }
        let Some(active) = state.peer else {
            return Err(FabricError::NotConnected(ep));
        };
        let active_ok = st
            .endpoints
            .get(&active)
            .is_some_and(|a| a.status == EpStatus::Connecting && a.peer == Some(ep));
        if !active_ok {
            return Err(FabricError::NotConnected(ep));
        }
        for id in [ep, active] {
            if let Some(s) = st.endpoints.get_mut(&id) {
                s.status = EpStatus::Connected;
            }
        }
        st.emit(
            active,
            CmEvent::Established {
                private_data: Some(private_data),
            },
        );
        st.emit(ep, CmEvent::Established { private_data: None });
        // Messages sent by the active side before our receives were
        // posted are waiting in its peer's receiver-not-ready queue.
        st.drain_rnr(ep);
        st.dispatch();
        Ok(())
    }

    fn reject(&self, ep: EndpointId) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        let state = st.ep(ep)?;
        let active = state.peer.take();
        state.status = EpStatus::Disconnected;
        if let Some(active) = active {
            if let Some(a) = st.endpoints.get_mut(&active) {
                a.status = EpStatus::Idle;
                a.peer = None;
            }
            st.emit(active, CmEvent::Rejected);
        }
        st.dispatch();
        Ok(())
    }

    fn disconnect(&self, ep: EndpointId) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        let state = st.ep(ep)?;
        let status = state.status;
        let peer = state.peer;
        *st.disconnect_calls.entry(ep).or_insert(0) += 1;
        match status {
            EpStatus::Connected => {
                st.break_connection(ep);
                st.emit(ep, CmEvent::Disconnected);
                st.timewait_exit(ep);
                if let Some(peer) = peer {
                    if st
                        .endpoints
                        .get(&peer)
                        .is_some_and(|p| p.status == EpStatus::Connected)
                    {
                        st.break_connection(peer);
                        st.emit(peer, CmEvent::Disconnected);
                    }
                }
            }
            EpStatus::Disconnected => st.timewait_exit(ep),
            EpStatus::Connecting => {
                if let Some(s) = st.endpoints.get_mut(&ep) {
                    s.status = EpStatus::Disconnected;
                    s.peer = None;
                }
                if let Some(peer) = peer {
                    if let Some(p) = st.endpoints.get_mut(&peer) {
                        p.peer = None;
                    }
                }
            }
            _ => {}
        }
        st.dispatch();
        Ok(())
    }

    fn local_addr(&self, ep: EndpointId) -> Option<SocketAddr> {
        self.net.state.lock().endpoints.get(&ep).and_then(|e| e.local)
    }

    fn peer_addr(&self, ep: EndpointId) -> Option<SocketAddr> {
        self.net.state.lock().endpoints.get(&ep).and_then(|e| e.dst)
    }

    fn register_region(
        &self,
        data: Bytes,
        access: AccessFlags,
    ) -> Result<RegionHandle, FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let id = st.alloc_id();
        st.next_key += 1;
        let key = st.next_key;
        let addr = st.alloc_vaddr(data.len() as u64);
        let handle = RegionHandle {
            id,
            lkey: key,
            rkey: key,
            addr,
            len: data.len() as u64,
            access,
        };
        let dev = st.devices.get_mut(&self.id).ok_or(FabricError::DeviceRemoved)?;
        dev.regions.insert(key, Region { handle, data });
        Ok(handle)
    }

    fn release_region(&self, region: &RegionHandle) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        let dev = st.devices.get_mut(&self.id).ok_or(FabricError::DeviceRemoved)?;
        match dev.regions.remove(&region.rkey) {
            Some(_) => Ok(()),
            None => {
                dev.unknown_releases += 1;
                Err(FabricError::UnknownHandle(region.id))
            }
        }
    }

    fn dma_map(&self, len: usize) -> Result<DmaMapping, FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let id = st.alloc_id();
        let addr = st.alloc_vaddr(len as u64);
        let dev = st.devices.get_mut(&self.id).ok_or(FabricError::DeviceRemoved)?;
        dev.mappings.insert(id);
        Ok(DmaMapping {
            id,
            addr,
            len,
            lkey: 0,
        })
    }

    fn dma_unmap(&self, mapping: DmaMapping) {
        let mut st = self.net.state.lock();
        if let Some(dev) = st.devices.get_mut(&self.id) {
            if !dev.mappings.remove(&mapping.id) {
                dev.unknown_unmaps += 1;
                tracing::warn!(id = mapping.id, "unmap of unknown dma mapping");
            }
        }
    }

    fn post_send(&self, ep: EndpointId, wr: SendWr) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let hold = st
            .devices
            .get(&self.id)
            .is_some_and(|d| d.hold_send_completions);
        let hold_delivery = st.hold_delivery;
        let state = st.ep(ep)?;
        let caps = state.qp.ok_or(FabricError::NoQueuePair(ep))?;
        if state.status != EpStatus::Connected {
            return Err(FabricError::NotConnected(ep));
        }
        if wr.num_sge > caps.max_send_sge {
            return Err(FabricError::InvalidState(format!(
                "{} send sges exceed {}",
                wr.num_sge, caps.max_send_sge
            )));
        }
        if state.sends_outstanding >= caps.max_send_wr {
            return Err(FabricError::QueueFull {
                endpoint: ep,
                kind: "send",
                max: caps.max_send_wr,
            });
        }
        state.sends_outstanding += 1;
        let peer = state.peer;
        let wc = WorkCompletion {
            wr_id: wr.wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: wr.data.len() as u32,
            data: None,
        };
        if hold {
            state.held_send_wcs.push(wc);
        } else {
            st.push_completion(ep, CqKind::Send, wc);
        }
        if let Some(peer) = peer {
            if hold_delivery {
                st.held.push_back((peer, wr.data));
            } else {
                st.deliver(peer, wr.data);
            }
        }
        st.dispatch();
        Ok(())
    }

    fn post_receive(&self, ep: EndpointId, wr: RecvWr) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let state = st.ep(ep)?;
        let caps = state.qp.ok_or(FabricError::NoQueuePair(ep))?;
        if wr.num_sge > caps.max_recv_sge {
            return Err(FabricError::InvalidState(format!(
                "{} receive sges exceed {}",
                wr.num_sge, caps.max_recv_sge
            )));
        }
        if state.recv_posted.len() as u32 >= caps.max_recv_wr {
            return Err(FabricError::QueueFull {
                endpoint: ep,
                kind: "receive",
                max: caps.max_recv_wr,
            });
        }
        if state.status == EpStatus::Disconnected {
            st.push_completion(
                ep,
                CqKind::Recv,
                WorkCompletion {
                    wr_id: wr.wr_id,
                    status: WcStatus::WrFlushError,
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                    data: None,
                },
            );
        } else {
            state.recv_posted.push_back(wr);
            st.drain_rnr(ep);
        }
        st.dispatch();
        Ok(())
    }

    fn post_remote_read(&self, ep: EndpointId, wr: ReadWr) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        self.check_present(&st)?;
        let state = st.ep(ep)?;
        let caps = state.qp.ok_or(FabricError::NoQueuePair(ep))?;
        if state.status != EpStatus::Connected {
            return Err(FabricError::NotConnected(ep));
        }
        if state.sends_outstanding >= caps.max_send_wr {
            return Err(FabricError::QueueFull {
                endpoint: ep,
                kind: "send",
                max: caps.max_send_wr,
            });
        }
        state.sends_outstanding += 1;
        let peer_dev = state
            .peer
            .and_then(|p| st.endpoints.get(&p))
            .map(|p| p.device);

        let local_ok = st
            .devices
            .get(&self.id)
            .and_then(|d| d.regions.get(&wr.local.rkey))
            .is_some_and(|r| r.handle.len >= wr.remote.size());
        let fetched = peer_dev
            .and_then(|d| st.devices.get(&d))
            .and_then(|d| d.regions.get(&wr.remote.rkey()))
            .and_then(|r| {
                if !r.handle.access.contains(AccessFlags::REMOTE_READ) {
                    return None;
                }
                let offset = wr.remote.addr().checked_sub(r.handle.addr)?;
                let end = offset.checked_add(wr.remote.size())?;
                if end > r.handle.len {
                    return None;
                }
                Some(r.data.slice(offset as usize..end as usize))
            });

        let wc = match (local_ok, fetched) {
            (true, Some(data)) => WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::Success,
                opcode: WcOpcode::RdmaRead,
                byte_len: data.len() as u32,
                data: Some(data),
            },
            (false, _) => WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::LocalLengthError,
                opcode: WcOpcode::RdmaRead,
                byte_len: 0,
                data: None,
            },
            (true, None) => WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::RemoteAccessError,
                opcode: WcOpcode::RdmaRead,
                byte_len: 0,
                data: None,
            },
        };
        st.push_completion(ep, CqKind::Send, wc);
        st.dispatch();
        Ok(())
    }

    fn poll_completion_queue(
        &self,
        ep: EndpointId,
        cq: CqKind,
        max: usize,
    ) -> Vec<WorkCompletion> {
        let mut st = self.net.state.lock();
        let Some(state) = st.endpoints.get_mut(&ep) else {
            return Vec::new();
        };
        let (queue, armed) = match cq {
            CqKind::Send => (&mut state.send_cq, &mut state.send_armed),
            CqKind::Recv => (&mut state.recv_cq, &mut state.recv_armed),
        };
        let n = queue.len().min(max);
        let out: Vec<WorkCompletion> = queue.drain(..n).collect();
        if queue.is_empty() {
            *armed = true;
        }
        if cq == CqKind::Send {
            state.sends_outstanding = state.sends_outstanding.saturating_sub(out.len() as u32);
        }
        out
    }

    fn set_cq_moderation(&self, ep: EndpointId, count: u16, usec: u16) -> Result<(), FabricError> {
        let mut st = self.net.state.lock();
        st.ep(ep)?.moderation = Some((count, usec));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const QP: QpCaps = QpCaps {
        max_send_wr: 4,
        max_recv_wr: 4,
        max_send_sge: 4,
        max_recv_sge: 4,
    };

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn drain(rx: &mut UnboundedReceiver<FabricEvent>) -> Vec<FabricEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn cm_names(events: &[FabricEvent]) -> Vec<&'static str> {
        events
            .iter()
            .filter_map(|e| match e {
                FabricEvent::Cm { event, .. } => Some(event.name()),
                _ => None,
            })
            .collect()
    }

    struct Pair {
        a: Arc<LoopbackDevice>,
        b: Arc<LoopbackDevice>,
        a_rx: UnboundedReceiver<FabricEvent>,
        b_rx: UnboundedReceiver<FabricEvent>,
        a_ep: EndpointId,
        b_ep: EndpointId,
        net: LoopbackNetwork,
    }

    fn connected_pair() -> Pair {
        let net = LoopbackNetwork::new();
        let a = net.add_device("lo0", ip(1), DeviceCaps::default());
        let b = net.add_device("lo1", ip(2), DeviceCaps::default());
        let (a_tx, mut a_rx) = unbounded_channel();
        let (b_tx, mut b_rx) = unbounded_channel();
        a.set_event_sink(a_tx);
        b.set_event_sink(b_tx);

        let listener = b.create_endpoint().unwrap();
        let addr = b.listen(listener, SocketAddr::new(ip(2), 7000)).unwrap();
        let a_ep = a.create_endpoint().unwrap();
        a.resolve_addr(a_ep, addr).unwrap();
        a.resolve_route(a_ep).unwrap();
        a.create_qp(a_ep, QP).unwrap();
        a.connect(a_ep, Bytes::from_static(b"hello")).unwrap();

        let b_ep = match drain(&mut b_rx).pop() {
            Some(FabricEvent::Cm {
                event: CmEvent::ConnectRequest {
                    child, private_data, ..
                },
                ..
            }) => {
                assert_eq!(&private_data[..], b"hello");
                child
            }
            other => panic!("expected connect request, got {other:?}"),
        };
        b.create_qp(b_ep, QP).unwrap();
        b.accept(b_ep, Bytes::from_static(b"ack")).unwrap();
        let a_events = drain(&mut a_rx);
        assert_eq!(
            cm_names(&a_events),
            vec!["ADDR_RESOLVED", "ROUTE_RESOLVED", "ESTABLISHED"]
        );
        assert_eq!(cm_names(&drain(&mut b_rx)), vec!["ESTABLISHED"]);
        Pair {
            a,
            b,
            a_rx,
            b_rx,
            a_ep,
            b_ep,
            net,
        }
    }

    fn recv_wr(wr_id: u64) -> RecvWr {
        RecvWr {
            wr_id,
            capacity: 64,
            num_sge: 1,
        }
    }

    fn send_wr(wr_id: u64, data: &'static [u8]) -> SendWr {
        SendWr {
            wr_id,
            data: Bytes::from_static(data),
            num_sge: 1,
        }
    }

    #[test]
    fn test_send_to_posted_receive() {
        let mut p = connected_pair();
        p.b.post_receive(p.b_ep, recv_wr(11)).unwrap();
        p.a.post_send(p.a_ep, send_wr(1, b"abc")).unwrap();

        let wcs = p.b.poll_completion_queue(p.b_ep, CqKind::Recv, 8);
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id, 11);
        assert_eq!(wcs[0].data.as_deref(), Some(&b"abc"[..]));
        assert!(matches!(
            drain(&mut p.b_rx)[..],
            [FabricEvent::Completion {
                cq: CqKind::Recv,
                ..
            }]
        ));

        let wcs = p.a.poll_completion_queue(p.a_ep, CqKind::Send, 8);
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].opcode, WcOpcode::Send);
        assert_eq!(wcs[0].byte_len, 3);
    }

    #[test]
    fn test_receiver_not_ready_queues_in_order() {
        let p = connected_pair();
        p.a.post_send(p.a_ep, send_wr(1, b"one")).unwrap();
        p.a.post_send(p.a_ep, send_wr(2, b"two")).unwrap();
        assert!(p.b.poll_completion_queue(p.b_ep, CqKind::Recv, 8).is_empty());

        p.b.post_receive(p.b_ep, recv_wr(5)).unwrap();
        p.b.post_receive(p.b_ep, recv_wr(6)).unwrap();
        let wcs = p.b.poll_completion_queue(p.b_ep, CqKind::Recv, 8);
        let data: Vec<_> = wcs.iter().map(|w| w.data.clone().unwrap()).collect();
        assert_eq!(data, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[test]
    fn test_send_queue_limit() {
        let p = connected_pair();
        for i in 0..4 {
            p.a.post_send(p.a_ep, send_wr(i, b"x")).unwrap();
        }
        let err = p.a.post_send(p.a_ep, send_wr(9, b"x")).unwrap_err();
        assert!(err.is_resource_exhaustion());
        assert_eq!(p.a.poll_completion_queue(p.a_ep, CqKind::Send, 2).len(), 2);
        p.a.post_send(p.a_ep, send_wr(10, b"x")).unwrap();
    }

    #[test]
    fn test_receive_sge_limit() {
        let p = connected_pair();
        let err = p
            .b
            .post_receive(
                p.b_ep,
                RecvWr {
                    wr_id: 1,
                    capacity: 64,
                    num_sge: 5,
                },
            )
            .unwrap_err();
        assert!(matches!(err, FabricError::InvalidState(_)));
    }

    #[test]
    fn test_oversized_message_is_length_error() {
        let p = connected_pair();
        p.b.post_receive(
            p.b_ep,
            RecvWr {
                wr_id: 3,
                capacity: 2,
                num_sge: 1,
            },
        )
        .unwrap();
        p.a.post_send(p.a_ep, send_wr(1, b"too long")).unwrap();
        let wcs = p.b.poll_completion_queue(p.b_ep, CqKind::Recv, 8);
        assert_eq!(wcs[0].status, WcStatus::LocalLengthError);
    }

    #[test]
    fn test_completion_event_fires_once_per_arming() {
        let mut p = connected_pair();
        p.a.post_send(p.a_ep, send_wr(1, b"a")).unwrap();
        p.a.post_send(p.a_ep, send_wr(2, b"b")).unwrap();
        assert_eq!(drain(&mut p.a_rx).len(), 1);
        p.a.poll_completion_queue(p.a_ep, CqKind::Send, 8);
        p.a.post_send(p.a_ep, send_wr(3, b"c")).unwrap();
        assert_eq!(drain(&mut p.a_rx).len(), 1);
    }

    #[test]
    fn test_remote_read() {
        let p = connected_pair();
        let src = p
            .b
            .register_region(Bytes::from_static(b"0123456789"), AccessFlags::REMOTE_READ)
            .unwrap();
        let sink = p
            .a
            .register_region(Bytes::from(vec![0u8; 4]), AccessFlags::LOCAL_WRITE)
            .unwrap();
        let remote = src.remote().subrange(2, 4).unwrap();
        p.a.post_remote_read(
            p.a_ep,
            ReadWr {
                wr_id: 77,
                remote,
                local: sink,
            },
        )
        .unwrap();
        let wcs = p.a.poll_completion_queue(p.a_ep, CqKind::Send, 8);
        assert_eq!(wcs[0].opcode, WcOpcode::RdmaRead);
        assert_eq!(wcs[0].data.as_deref(), Some(&b"2345"[..]));

        p.b.release_region(&src).unwrap();
        p.a.post_remote_read(
            p.a_ep,
            ReadWr {
                wr_id: 78,
                remote,
                local: sink,
            },
        )
        .unwrap();
        let wcs = p.a.poll_completion_queue(p.a_ep, CqKind::Send, 8);
        assert_eq!(wcs[0].status, WcStatus::RemoteAccessError);
        assert!(p.b.release_region(&src).is_err());
        assert_eq!(p.b.unknown_releases(), 1);
        assert_eq!(p.b.live_regions(), 0);
    }

    #[test]
    fn test_read_requires_remote_read_access() {
        let p = connected_pair();
        let src = p
            .b
            .register_region(Bytes::from_static(b"data"), AccessFlags::LOCAL_WRITE)
            .unwrap();
        let sink = p
            .a
            .register_region(Bytes::from(vec![0u8; 4]), AccessFlags::LOCAL_WRITE)
            .unwrap();
        p.a.post_remote_read(
            p.a_ep,
            ReadWr {
                wr_id: 1,
                remote: src.remote(),
                local: sink,
            },
        )
        .unwrap();
        let wcs = p.a.poll_completion_queue(p.a_ep, CqKind::Send, 8);
        assert_eq!(wcs[0].status, WcStatus::RemoteAccessError);
    }

    #[test]
    fn test_disconnect_sequence_and_flush() {
        let mut p = connected_pair();
        p.a.post_receive(p.a_ep, recv_wr(1)).unwrap();
        p.a.disconnect(p.a_ep).unwrap();
        let a_events = drain(&mut p.a_rx);
        assert_eq!(cm_names(&a_events), vec!["DISCONNECTED", "TIMEWAIT_EXIT"]);
        let flushed = p.a.poll_completion_queue(p.a_ep, CqKind::Recv, 8);
        assert_eq!(flushed[0].status, WcStatus::WrFlushError);

        assert_eq!(cm_names(&drain(&mut p.b_rx)), vec!["DISCONNECTED"]);
        p.b.disconnect(p.b_ep).unwrap();
        p.b.disconnect(p.b_ep).unwrap();
        assert_eq!(cm_names(&drain(&mut p.b_rx)), vec!["TIMEWAIT_EXIT"]);
        assert_eq!(p.b.disconnect_calls(p.b_ep), 2);
        assert!(p.a.post_send(p.a_ep, send_wr(1, b"x")).is_err());
    }

    #[test]
    fn test_hold_delivery() {
        let p = connected_pair();
        p.b.post_receive(p.b_ep, recv_wr(1)).unwrap();
        p.a.post_receive(p.a_ep, recv_wr(2)).unwrap();
        p.net.hold_delivery(true);
        p.a.post_send(p.a_ep, send_wr(1, b"from a")).unwrap();
        p.b.post_send(p.b_ep, send_wr(1, b"from b")).unwrap();
        assert_eq!(p.net.held_messages(), 2);
        assert!(p.b.poll_completion_queue(p.b_ep, CqKind::Recv, 8).is_empty());
        p.net.release_delivery();
        assert_eq!(p.b.poll_completion_queue(p.b_ep, CqKind::Recv, 8).len(), 1);
        assert_eq!(p.a.poll_completion_queue(p.a_ep, CqKind::Recv, 8).len(), 1);
    }

    #[test]
    fn test_hold_send_completions() {
        let p = connected_pair();
        p.b.post_receive(p.b_ep, recv_wr(1)).unwrap();
        p.a.hold_send_completions(true);
        p.a.post_send(p.a_ep, send_wr(1, b"x")).unwrap();
        assert!(p.a.poll_completion_queue(p.a_ep, CqKind::Send, 8).is_empty());
        assert_eq!(p.b.poll_completion_queue(p.b_ep, CqKind::Recv, 8).len(), 1);
        p.a.release_send_completions();
        assert_eq!(p.a.poll_completion_queue(p.a_ep, CqKind::Send, 8).len(), 1);
    }

    #[test]
    fn test_mapping_accounting() {
        let net = LoopbackNetwork::new();
        let dev = net.add_device("lo0", ip(1), DeviceCaps::default());
        let m1 = dev.dma_map(4096).unwrap();
        let m2 = dev.dma_map(100).unwrap();
        assert_eq!(dev.live_mappings(), 2);
        let stale = DmaMapping {
            id: m1.id,
            addr: m1.addr,
            len: m1.len,
            lkey: m1.lkey,
        };
        dev.dma_unmap(m1);
        dev.dma_unmap(m2);
        assert_eq!(dev.live_mappings(), 0);
        dev.dma_unmap(stale);
        assert_eq!(dev.unknown_unmaps(), 1);
    }

    #[test]
    fn test_connect_without_listener_is_rejected() {
        let net = LoopbackNetwork::new();
        let a = net.add_device("lo0", ip(1), DeviceCaps::default());
        let _b = net.add_device("lo1", ip(2), DeviceCaps::default());
        let (tx, mut rx) = unbounded_channel();
        a.set_event_sink(tx);
        let ep = a.create_endpoint().unwrap();
        a.resolve_addr(ep, SocketAddr::new(ip(2), 9)).unwrap();
        a.resolve_route(ep).unwrap();
        a.connect(ep, Bytes::new()).unwrap();
        assert_eq!(
            cm_names(&drain(&mut rx)),
            vec!["ADDR_RESOLVED", "ROUTE_RESOLVED", "REJECTED"]
        );
    }

    #[test]
    fn test_unknown_address_is_addr_error() {
        let net = LoopbackNetwork::new();
        let a = net.add_device("lo0", ip(1), DeviceCaps::default());
        let (tx, mut rx) = unbounded_channel();
        a.set_event_sink(tx);
        let ep = a.create_endpoint().unwrap();
        a.resolve_addr(ep, SocketAddr::new(ip(9), 9)).unwrap();
        assert_eq!(cm_names(&drain(&mut rx)), vec!["ADDR_ERROR"]);
    }

    #[test]
    fn test_listen_addr_in_use() {
        let net = LoopbackNetwork::new();
        let a = net.add_device("lo0", ip(1), DeviceCaps::default());
        let l1 = a.create_endpoint().unwrap();
        let l2 = a.create_endpoint().unwrap();
        let addr = SocketAddr::new(ip(1), 5000);
        a.listen(l1, addr).unwrap();
        assert_eq!(a.listen(l2, addr), Err(FabricError::AddrInUse(addr)));
        a.destroy_endpoint(l1);
        a.listen(l2, addr).unwrap();
    }

    #[test]
    fn test_device_removal_event() {
        let mut p = connected_pair();
        p.a.remove();
        let events = drain(&mut p.a_rx);
        assert_eq!(cm_names(&events), vec!["DEVICE_REMOVAL"]);
        assert_eq!(p.a.create_endpoint(), Err(FabricError::DeviceRemoved));
    }

    #[test]
    fn test_moderation_recorded() {
        let p = connected_pair();
        p.a.set_cq_moderation(p.a_ep, 16, 40).unwrap();
        assert_eq!(p.a.moderation(p.a_ep), Some((16, 40)));
    }
}
