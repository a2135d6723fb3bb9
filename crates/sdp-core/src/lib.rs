//! Sockets Direct Protocol engine.
//!
//! Stream sockets over an RDMA fabric: data moves through credit-controlled
//! send/receive rings, large writes can be pulled by the peer with remote
//! reads, and connection setup and teardown follow TCP's state machine on
//! top of the fabric's connection manager.
//!
//! # Architecture
//!
//! - `SdpStack`: one per fabric device. Owns the socket registry, consumes
//!   fabric events on a dispatcher task and runs the periodic poll /
//!   interrupt-moderation sweep.
//! - `SdpSocket` / `SdpListener`: application handles, also usable through
//!   the `Socket` / `Listener` / `AsyncConnector` traits in [`transport`].
//! - `conn`: per-connection state under one lock and the `drive` posting
//!   engine; `completion`, `rx`, `tx` and `cm` extend it with the completion
//!   handlers, the receive and send paths and the connection-manager events.
//! - `ring` / `credit`: descriptor rings and credit accounting.
//! - `zcopy` / `resize`: remote-read advertisements and receive-buffer
//!   resize negotiation.

pub mod config;
pub mod credit;
pub mod error;
pub mod moderation;
pub mod resize;
pub mod ring;
pub mod runtime;
pub mod state;
pub mod stats;
pub mod transport;
pub mod zcopy;

mod cm;
mod completion;
mod conn;
mod listener;
mod registry;
mod rx;
mod socket;
mod stack;
mod tx;

pub use config::SdpConfig;
pub use error::SdpError;
pub use socket::{SdpListener, SdpSocket};
pub use stack::SdpStack;
pub use state::TcpState;
pub use stats::SocketStats;
pub use transport::{recv_frame, send_frame, AsyncConnector, Listener, Socket, MAX_FRAME_SIZE};
pub use tx::SendFlags;
