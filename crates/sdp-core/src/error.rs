use std::io;

use sdp_proto::ProtoError;
use sdp_verbs::FabricError;
use thiserror::Error;

use crate::ring::RingError;

/// Errors surfaced by sockets and the stack.
///
/// A connection records at most one error; every blocked operation on the
/// connection wakes and returns it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdpError {
    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    TimedOut,

    #[error("interrupted")]
    Interrupted,

    #[error("connection reset")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("config error: {0}")]
    Config(String),

    #[error("stack shut down")]
    Shutdown,

    /// Completion bookkeeping went out of step with the queue pair.
    #[error("ring fault: {0}")]
    Ring(#[from] RingError),
}

impl From<sdp_config::ConfigError> for SdpError {
    fn from(err: sdp_config::ConfigError) -> Self {
        SdpError::Config(err.to_string())
    }
}

impl From<SdpError> for io::Error {
    fn from(err: SdpError) -> Self {
        let kind = match &err {
            SdpError::WouldBlock => io::ErrorKind::WouldBlock,
            SdpError::TimedOut => io::ErrorKind::TimedOut,
            SdpError::Interrupted => io::ErrorKind::Interrupted,
            SdpError::ConnectionReset => io::ErrorKind::ConnectionReset,
            SdpError::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            SdpError::NotConnected => io::ErrorKind::NotConnected,
            SdpError::AlreadyConnected => io::ErrorKind::AlreadyExists,
            SdpError::InvalidArgument(_) | SdpError::Config(_) => io::ErrorKind::InvalidInput,
            SdpError::Protocol(_) => io::ErrorKind::InvalidData,
            SdpError::Fabric(FabricError::AddrInUse(_)) => io::ErrorKind::AddrInUse,
            SdpError::Fabric(_) | SdpError::Shutdown | SdpError::Ring(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
