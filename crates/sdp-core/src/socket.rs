//! Application-facing socket and listener handles.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use sdp_verbs::EndpointId;

use crate::conn::Connection;
use crate::error::SdpError;
use crate::listener::ListenState;
use crate::state::TcpState;
use crate::stats::SocketStats;
use crate::tx::SendFlags;

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// A connected SDP stream socket.
///
/// Dropping the socket closes it gracefully; the connection finishes its
/// disconnect handshake in the background.
pub struct SdpSocket {
    conn: Arc<Connection>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl SdpSocket {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        let local = conn.local_addr().unwrap_or_else(unspecified);
        let peer = conn.peer_addr().unwrap_or_else(unspecified);
        Self { conn, local, peer }
    }

    /// Send all of `data`. Large writes may be transferred by remote read.
    pub async fn send(&self, data: Bytes) -> Result<usize, SdpError> {
        self.conn.send(data, SendFlags::empty()).await
    }

    pub async fn send_with(&self, data: Bytes, flags: SendFlags) -> Result<usize, SdpError> {
        self.conn.send(data, flags).await
    }

    /// Read up to `max` bytes; an empty buffer means end of stream.
    pub async fn recv(&self, max: usize) -> Result<Bytes, SdpError> {
        self.conn.recv(max).await
    }

    pub async fn recv_exact(&self, n: usize) -> Result<Bytes, SdpError> {
        self.conn.recv_exact(n).await
    }

    /// Take the out-of-band byte if one arrived.
    pub fn recv_urgent(&self) -> Result<u8, SdpError> {
        self.conn.recv_urgent()
    }

    /// Stop sending; the peer reads end of stream after the queued data.
    pub fn shutdown_write(&self) {
        self.conn.shutdown_write();
    }

    pub fn close(&self) {
        self.conn.close();
    }

    /// Reset the connection without an orderly shutdown.
    pub fn abort(&self) {
        self.conn.abort();
    }

    /// Make the current or next blocking call return `Interrupted`.
    pub fn interrupt(&self) {
        self.conn.interrupt();
    }

    pub fn set_nodelay(&self, nodelay: bool) {
        self.conn.set_nodelay(nodelay);
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.conn.set_nonblocking(nonblocking);
    }

    /// Ask the peer to post receive buffers of `frags` fragments.
    pub fn request_resize(&self, frags: u32) -> Result<(), SdpError> {
        self.conn.request_resize(frags)
    }

    pub fn state(&self) -> TcpState {
        self.conn.state()
    }

    pub fn stats(&self) -> SocketStats {
        self.conn.stats_snapshot()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn endpoint(&self) -> EndpointId {
        self.conn.ep
    }
}

impl Drop for SdpSocket {
    fn drop(&mut self) {
        self.conn.close();
    }
}

impl std::fmt::Debug for SdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdpSocket")
            .field("ep", &self.conn.ep)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("state", &self.conn.state())
            .finish()
    }
}

/// A listening SDP socket.
pub struct SdpListener {
    state: Arc<ListenState>,
}

impl SdpListener {
    pub(crate) fn new(state: Arc<ListenState>) -> Self {
        Self { state }
    }

    /// Wait for the next established connection. Fails with `NotConnected`
    /// once the listener is closed.
    pub async fn accept(&self) -> Result<SdpSocket, SdpError> {
        let conn = self.state.accept().await?;
        Ok(SdpSocket::new(conn))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr
    }

    pub fn endpoint(&self) -> EndpointId {
        self.state.ep
    }

    /// Stop listening and reset connections not yet accepted.
    pub fn close(&self) {
        self.state.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl Drop for SdpListener {
    fn drop(&mut self) {
        self.state.close();
    }
}
