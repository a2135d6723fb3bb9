//! The fabric collaborator interface.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::buf::{AccessFlags, DmaMapping, RegionHandle, RemoteBuf};
use crate::device::DeviceInfo;
use crate::error::FabricError;

/// Identifies a connection-manager endpoint (and its queue pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// Queue-pair sizing requested at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CqKind {
    Send,
    Recv,
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// Received message larger than the posted buffer.
    LocalLengthError,
    /// Outstanding work flushed because the queue pair left the connected state.
    WrFlushError,
    /// Remote key invalid, region released, or access out of bounds.
    RemoteAccessError,
    RemoteOpError,
    RetryExceeded,
}

impl WcStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, WcStatus::Success)
    }
}

/// Work completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaRead,
    Recv,
}

/// One entry reaped from a completion queue.
#[derive(Debug, Clone)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Bytes transferred.
    pub byte_len: u32,
    /// Received bytes (receives) or fetched bytes (remote reads).
    pub data: Option<Bytes>,
}

/// A send work request. `data` is the full encoded message.
#[derive(Debug, Clone)]
pub struct SendWr {
    pub wr_id: u64,
    pub data: Bytes,
    pub num_sge: u32,
}

/// A receive work request for a buffer of `capacity` bytes spread over
/// `num_sge` fragments.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: u64,
    pub capacity: usize,
    pub num_sge: u32,
}

/// A remote-read work request into the local region `local`.
#[derive(Debug, Clone, Copy)]
pub struct ReadWr {
    pub wr_id: u64,
    pub remote: RemoteBuf,
    pub local: RegionHandle,
}

/// Connection-manager events.
#[derive(Debug, Clone)]
pub enum CmEvent {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    /// Incoming connection on a listening endpoint. `child` is the new
    /// endpoint representing the connection.
    ConnectRequest {
        child: EndpointId,
        private_data: Bytes,
        peer: SocketAddr,
    },
    ConnectError,
    Unreachable,
    Rejected,
    /// Connection established. The active side receives the acceptor's
    /// private data.
    Established { private_data: Option<Bytes> },
    Disconnected,
    TimewaitExit,
    DeviceRemoval,
}

impl CmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CmEvent::AddrResolved => "ADDR_RESOLVED",
            CmEvent::AddrError => "ADDR_ERROR",
            CmEvent::RouteResolved => "ROUTE_RESOLVED",
            CmEvent::RouteError => "ROUTE_ERROR",
            CmEvent::ConnectRequest { .. } => "CONNECT_REQUEST",
            CmEvent::ConnectError => "CONNECT_ERROR",
            CmEvent::Unreachable => "UNREACHABLE",
            CmEvent::Rejected => "REJECTED",
            CmEvent::Established { .. } => "ESTABLISHED",
            CmEvent::Disconnected => "DISCONNECTED",
            CmEvent::TimewaitExit => "TIMEWAIT_EXIT",
            CmEvent::DeviceRemoval => "DEVICE_REMOVAL",
        }
    }
}

/// Asynchronous notification from the fabric.
#[derive(Debug, Clone)]
pub enum FabricEvent {
    Cm { endpoint: EndpointId, event: CmEvent },
    /// The completion queue has new entries. Fires once per arming; a poll
    /// that drains the queue re-arms it.
    Completion { endpoint: EndpointId, cq: CqKind },
}

impl FabricEvent {
    pub fn endpoint(&self) -> EndpointId {
        match self {
            FabricEvent::Cm { endpoint, .. } | FabricEvent::Completion { endpoint, .. } => {
                *endpoint
            }
        }
    }
}

pub type EventSender = UnboundedSender<FabricEvent>;

/// RDMA fabric primitives used by the SDP engine.
///
/// Calls are non-blocking. Operations the real connection manager completes
/// asynchronously (resolution, connect, accept, disconnect) report their
/// outcome as [`CmEvent`]s on the installed event sink.
pub trait Fabric: Send + Sync + 'static {
    fn device(&self) -> &DeviceInfo;

    /// Install the channel that receives this device's events.
    fn set_event_sink(&self, sink: EventSender);

    fn create_endpoint(&self) -> Result<EndpointId, FabricError>;
    /// Create the queue pair backing `ep`.
    fn create_qp(&self, ep: EndpointId, caps: QpCaps) -> Result<(), FabricError>;
    fn destroy_endpoint(&self, ep: EndpointId);

    fn listen(&self, ep: EndpointId, addr: SocketAddr) -> Result<SocketAddr, FabricError>;
    fn resolve_addr(&self, ep: EndpointId, dst: SocketAddr) -> Result<(), FabricError>;
    fn resolve_route(&self, ep: EndpointId) -> Result<(), FabricError>;
    fn connect(&self, ep: EndpointId, private_data: Bytes) -> Result<(), FabricError>;
    fn accept(&self, ep: EndpointId, private_data: Bytes) -> Result<(), FabricError>;
    fn reject(&self, ep: EndpointId) -> Result<(), FabricError>;
    fn disconnect(&self, ep: EndpointId) -> Result<(), FabricError>;
    fn local_addr(&self, ep: EndpointId) -> Option<SocketAddr>;
    fn peer_addr(&self, ep: EndpointId) -> Option<SocketAddr>;

    fn register_region(&self, data: Bytes, access: AccessFlags)
        -> Result<RegionHandle, FabricError>;
    fn release_region(&self, region: &RegionHandle) -> Result<(), FabricError>;
    fn dma_map(&self, len: usize) -> Result<DmaMapping, FabricError>;
    fn dma_unmap(&self, mapping: DmaMapping);

    fn post_send(&self, ep: EndpointId, wr: SendWr) -> Result<(), FabricError>;
    fn post_receive(&self, ep: EndpointId, wr: RecvWr) -> Result<(), FabricError>;
    fn post_remote_read(&self, ep: EndpointId, wr: ReadWr) -> Result<(), FabricError>;
    fn poll_completion_queue(&self, ep: EndpointId, cq: CqKind, max: usize)
        -> Vec<WorkCompletion>;
    /// Interrupt moderation: raise an interrupt after `count` completions or
    /// `usec` microseconds, whichever comes first.
    fn set_cq_moderation(&self, ep: EndpointId, count: u16, usec: u16)
        -> Result<(), FabricError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_endpoint() {
        let ev = FabricEvent::Completion {
            endpoint: EndpointId(3),
            cq: CqKind::Recv,
        };
        assert_eq!(ev.endpoint(), EndpointId(3));
        let ev = FabricEvent::Cm {
            endpoint: EndpointId(4),
            event: CmEvent::Disconnected,
        };
        assert_eq!(ev.endpoint(), EndpointId(4));
        assert_eq!(EndpointId(4).to_string(), "ep#4");
    }

    #[test]
    fn test_cm_event_names() {
        assert_eq!(CmEvent::TimewaitExit.name(), "TIMEWAIT_EXIT");
        assert_eq!(
            CmEvent::Established { private_data: None }.name(),
            "ESTABLISHED"
        );
    }
}
