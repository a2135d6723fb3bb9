//! Transport-neutral socket traits and length-prefixed framing on top of
//! them.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::SdpError;
use crate::socket::{SdpListener, SdpSocket};
use crate::stack::SdpStack;

/// Largest frame `send_frame` / `recv_frame` accept.
pub const MAX_FRAME_SIZE: usize = 64 << 20;

const FRAME_HEADER_SIZE: usize = 4;

/// A connected byte stream.
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    /// Send all of `data`.
    async fn send(&self, data: Bytes) -> Result<(), SdpError>;

    /// Receive up to `max` bytes. An empty buffer means the peer closed.
    async fn recv(&self, max: usize) -> Result<Bytes, SdpError>;

    fn peer_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> SocketAddr;

    /// Close the socket gracefully.
    async fn close(&self);
}

/// Accepts incoming connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Socket: Socket;

    /// Wait for the next connection, or fail once the listener is closed.
    async fn accept(&self) -> Result<Self::Socket, SdpError>;

    fn local_addr(&self) -> SocketAddr;
}

/// Establishes connections to remote addresses.
#[async_trait]
pub trait AsyncConnector<S: Socket>: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> Result<S, SdpError>;
}

#[async_trait]
impl Socket for SdpSocket {
    async fn send(&self, data: Bytes) -> Result<(), SdpError> {
        SdpSocket::send(self, data).await.map(|_| ())
    }

    async fn recv(&self, max: usize) -> Result<Bytes, SdpError> {
        SdpSocket::recv(self, max).await
    }

    fn peer_addr(&self) -> SocketAddr {
        SdpSocket::peer_addr(self)
    }

    fn local_addr(&self) -> SocketAddr {
        SdpSocket::local_addr(self)
    }

    async fn close(&self) {
        SdpSocket::close(self);
    }
}

#[async_trait]
impl Listener for SdpListener {
    type Socket = SdpSocket;

    async fn accept(&self) -> Result<SdpSocket, SdpError> {
        SdpListener::accept(self).await
    }

    fn local_addr(&self) -> SocketAddr {
        SdpListener::local_addr(self)
    }
}

#[async_trait]
impl AsyncConnector<SdpSocket> for SdpStack {
    async fn connect(&self, addr: SocketAddr) -> Result<SdpSocket, SdpError> {
        SdpStack::connect(self, addr).await
    }
}

/// Send `payload` as one frame: a 4-byte big-endian length, then the bytes.
pub async fn send_frame<S: Socket>(socket: &S, payload: &[u8]) -> Result<(), SdpError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(SdpError::InvalidArgument(format!(
            "frame of {} bytes exceeds {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(payload);
    socket.send(frame.freeze()).await
}

/// Read one frame written by [`send_frame`]. Returns `None` if the peer
/// closed cleanly between frames.
pub async fn recv_frame<S: Socket>(socket: &S) -> Result<Option<Bytes>, SdpError> {
    let Some(header) = read_exact(socket, FRAME_HEADER_SIZE, true).await? else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SdpError::InvalidArgument(format!(
            "incoming frame of {len} bytes exceeds {MAX_FRAME_SIZE}"
        )));
    }
    match read_exact(socket, len, false).await? {
        Some(payload) => Ok(Some(payload)),
        None => Err(SdpError::ConnectionReset),
    }
}

/// Read exactly `n` bytes. End of stream before the first byte yields
/// `None` when `eof_ok`; anywhere else it is a reset.
async fn read_exact<S: Socket>(
    socket: &S,
    n: usize,
    eof_ok: bool,
) -> Result<Option<Bytes>, SdpError> {
    let mut buf = BytesMut::with_capacity(n);
    while buf.len() < n {
        let chunk = socket.recv(n - buf.len()).await?;
        if chunk.is_empty() {
            if buf.is_empty() && eof_ok {
                return Ok(None);
            }
            return Err(SdpError::ConnectionReset);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Some(buf.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Delivers its preloaded bytes in chunks of at most `chunk`.
    struct MockSocket {
        sent: Mutex<Vec<Bytes>>,
        incoming: Mutex<BytesMut>,
        chunk: usize,
    }

    impl MockSocket {
        fn new(incoming: &[u8], chunk: usize) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                incoming: Mutex::new(BytesMut::from(incoming)),
                chunk,
            }
        }
    }

    #[async_trait]
    impl Socket for MockSocket {
        async fn send(&self, data: Bytes) -> Result<(), SdpError> {
            self.sent.lock().push(data);
            Ok(())
        }

        async fn recv(&self, max: usize) -> Result<Bytes, SdpError> {
            let mut incoming = self.incoming.lock();
            let n = incoming.len().min(max).min(self.chunk);
            Ok(incoming.split_to(n).freeze())
        }

        fn peer_addr(&self) -> SocketAddr {
            "10.0.0.2:1".parse().unwrap()
        }

        fn local_addr(&self) -> SocketAddr {
            "10.0.0.1:1".parse().unwrap()
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_send_frame_layout() {
        let socket = MockSocket::new(b"", 1);
        send_frame(&socket, b"hello").await.unwrap();
        let sent = socket.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..], b"\x00\x00\x00\x05hello");
    }

    #[tokio::test]
    async fn test_recv_frames_across_chunks() {
        let wire = b"\x00\x00\x00\x03abc\x00\x00\x00\x00\x00\x00\x00\x02xy";
        let socket = MockSocket::new(wire, 3);
        assert_eq!(recv_frame(&socket).await.unwrap().unwrap(), &b"abc"[..]);
        assert_eq!(recv_frame(&socket).await.unwrap().unwrap(), &b""[..]);
        assert_eq!(recv_frame(&socket).await.unwrap().unwrap(), &b"xy"[..]);
        assert_eq!(recv_frame(&socket).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_reset() {
        let socket = MockSocket::new(b"\x00\x00\x00\x05ab", 16);
        assert_eq!(recv_frame(&socket).await, Err(SdpError::ConnectionReset));
        let socket = MockSocket::new(b"\x00\x00", 16);
        assert_eq!(recv_frame(&socket).await, Err(SdpError::ConnectionReset));
    }

    #[tokio::test]
    async fn test_oversized_frames_rejected() {
        let socket = MockSocket::new(b"\xff\xff\xff\xff", 16);
        assert!(matches!(
            recv_frame(&socket).await,
            Err(SdpError::InvalidArgument(_))
        ));
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            send_frame(&socket, &big).await,
            Err(SdpError::InvalidArgument(_))
        ));
    }
}
