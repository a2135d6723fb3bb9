use thiserror::Error;

use crate::fabric::EndpointId;

/// Errors returned synchronously by [`Fabric`](crate::Fabric) calls.
///
/// Failures of posted work are not reported here; they surface as
/// completions with a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FabricError {
    /// The endpoint id is unknown or was destroyed.
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),

    /// The endpoint has no queue pair yet.
    #[error("endpoint {0} has no queue pair")]
    NoQueuePair(EndpointId),

    /// The operation needs a connected endpoint.
    #[error("endpoint {0} is not connected")]
    NotConnected(EndpointId),

    /// More work requests than the queue pair was created for.
    #[error("{kind} queue full on endpoint {endpoint} (max {max})")]
    QueueFull {
        endpoint: EndpointId,
        kind: &'static str,
        max: u32,
    },

    /// The listen address is taken.
    #[error("address in use: {0}")]
    AddrInUse(std::net::SocketAddr),

    /// Memory registration failed.
    #[error("memory registration failed: {0}")]
    Registration(String),

    /// The region or mapping handle is not registered.
    #[error("unknown memory handle {0}")]
    UnknownHandle(u64),

    /// The device was removed.
    #[error("device removed")]
    DeviceRemoved,

    /// The request is invalid in the endpoint's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl FabricError {
    /// Resource exhaustion is recoverable: the caller may retry later.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, FabricError::QueueFull { .. } | FabricError::Registration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_queue_full() {
        let err = FabricError::QueueFull {
            endpoint: EndpointId(7),
            kind: "send",
            max: 64,
        };
        let s = err.to_string();
        assert!(s.contains("send queue full"));
        assert!(s.contains("ep#7"));
        assert!(err.is_resource_exhaustion());
    }

    #[test]
    fn test_not_connected_is_not_exhaustion() {
        assert!(!FabricError::NotConnected(EndpointId(1)).is_resource_exhaustion());
    }
}
