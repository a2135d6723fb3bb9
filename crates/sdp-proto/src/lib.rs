//! Wire format of the Sockets-Direct protocol (SDP).
//!
//! Every message on the queue pair starts with a 16-byte base header
//! ([`Bsdh`]) followed by an optional message-specific extended header and
//! payload. HELLO and HELLO_ACK are not sent on the queue pair; they travel as
//! connection-manager private data during connection establishment.

pub mod error;
pub mod header;
pub mod message;

pub use error::ProtoError;
pub use header::{Bsdh, HeaderFlags, MessageId, BSDH_SIZE};
pub use message::{
    Capabilities, Hello, HelloAck, Message, SrcAvail, HELLO_ACK_SIZE, HELLO_SIZE,
    SDP_PROTOCOL_VERSION, SRC_AVAIL_SIZE,
};
