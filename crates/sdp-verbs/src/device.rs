//! Device description.

use serde::{Deserialize, Serialize};

/// Link layer type of the device port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkLayer {
    /// InfiniBand.
    Infiniband,
    /// RoCE (RDMA over Converged Ethernet).
    Ethernet,
    /// In-memory loopback.
    Loopback,
}

impl std::fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkLayer::Infiniband => write!(f, "INFINIBAND"),
            LinkLayer::Ethernet => write!(f, "ETHERNET"),
            LinkLayer::Loopback => write!(f, "LOOPBACK"),
        }
    }
}

/// Device limits the engine sizes itself against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Max work requests per queue.
    pub max_qp_wr: u32,
    /// Max scatter/gather entries per send request.
    pub max_send_sge: u32,
    /// Max scatter/gather entries per receive request. Bounds how many
    /// fragments a single receive buffer may span.
    pub max_recv_sge: u32,
    /// Max outstanding remote reads per queue pair.
    pub max_rd_atomic: u32,
    /// Whether remote-read (zero-copy) transfers are possible.
    pub remote_read: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            max_qp_wr: 16384,
            max_send_sge: 32,
            max_recv_sge: 32,
            max_rd_atomic: 16,
            remote_read: true,
        }
    }
}

/// An RDMA-capable device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device ID (index in the device list).
    pub id: u8,
    /// Device name (e.g., "mlx5_0").
    pub name: String,
    pub link_layer: LinkLayer,
    pub caps: DeviceCaps,
}

impl DeviceInfo {
    pub fn new(id: u8, name: impl Into<String>, link_layer: LinkLayer, caps: DeviceCaps) -> Self {
        Self {
            id,
            name: name.into(),
            link_layer,
            caps,
        }
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{} ({}, recv_sge={}, read={})",
            self.name, self.id, self.link_layer, self.caps.max_recv_sge, self.caps.remote_read
        )
    }
}
