use thiserror::Error;

/// Errors raised while decoding SDP messages.
///
/// Every variant is a protocol violation: the engine treats all of them as
/// fatal for the connection that produced the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Not enough bytes for the structure being decoded.
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    /// The message id byte is not a known SDP message.
    #[error("unknown message id {0:#04x}")]
    UnknownMessageId(u8),

    /// The header's length field disagrees with the bytes received.
    #[error("length mismatch: header says {declared} payload bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// The peer speaks an incompatible protocol version.
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    /// A message that is only valid as connection-manager private data was
    /// received on the queue pair (or vice versa).
    #[error("message {0:?} not allowed here")]
    Misplaced(crate::header::MessageId),
}
