//! Receive path.

use bytes::{Bytes, BytesMut};
use sdp_verbs::{AccessFlags, ReadWr};
use tracing::{debug, trace, warn};

use crate::completion::remove_advert_marker;
use crate::conn::{ConnInner, Connection, RxItem};
use crate::error::SdpError;
use crate::ring::{OpTag, WrId};
use crate::state::TcpState;
use crate::zcopy::RxReadState;

impl Connection {
    /// Read up to `max` bytes. Returns an empty buffer at end of stream.
    pub(crate) async fn recv(&self, max: usize) -> Result<Bytes, SdpError> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        self.wait_for(None, true, |inner| self.recv_step(inner, max))
            .await?
    }

    /// One attempt to satisfy a read. `None` means wait for more.
    fn recv_step(&self, inner: &mut ConnInner, max: usize) -> Option<Result<Bytes, SdpError>> {
        loop {
            match inner.rx_queue.front_mut() {
                Some(RxItem::Data(data)) => {
                    let chunk = if data.len() > max {
                        data.split_to(max)
                    } else {
                        let chunk = std::mem::take(data);
                        inner.rx_queue.pop_front();
                        chunk
                    };
                    inner.rx_bytes_queued -= chunk.len();
                    // Freed budget may allow more receives to be posted.
                    self.drive(inner);
                    return Some(Ok(chunk));
                }
                Some(RxItem::Advert(mseq)) => {
                    let mseq = *mseq;
                    if let Some(e) = &inner.error {
                        return Some(Err(e.clone()));
                    }
                    let pending = inner
                        .rx_sa
                        .as_ref()
                        .filter(|rx| rx.mseq == mseq)
                        .map(|rx| rx.is_read_inflight());
                    match pending {
                        Some(inflight) => {
                            if !inflight {
                                if let Err(e) = self.post_read(inner) {
                                    if let SdpError::Fabric(f) = &e {
                                        if f.is_resource_exhaustion() {
                                            trace!(ep = %self.ep, error = %e, "remote read deferred");
                                            return self.would_block(inner);
                                        }
                                    }
                                    warn!(ep = %self.ep, error = %e, "remote read failed");
                                    self.fail(inner, SdpError::ConnectionReset);
                                    return Some(Err(e));
                                }
                            }
                            return self.would_block(inner);
                        }
                        None => {
                            // The advertisement is gone; its marker is stale.
                            remove_advert_marker(&mut inner.rx_queue, mseq);
                        }
                    }
                }
                None => {
                    if let Some(e) = &inner.error {
                        return Some(Err(e.clone()));
                    }
                    if inner.peer_closed
                        || inner.read_closed
                        || matches!(inner.state, TcpState::TimeWait | TcpState::Close)
                    {
                        return Some(Ok(Bytes::new()));
                    }
                    return self.would_block(inner);
                }
            }
        }
    }

    fn would_block(&self, inner: &ConnInner) -> Option<Result<Bytes, SdpError>> {
        if inner.nonblocking {
            Some(Err(SdpError::WouldBlock))
        } else {
            None
        }
    }

    /// Pull the next chunk of the inbound advertisement with a remote read.
    fn post_read(&self, inner: &mut ConnInner) -> Result<(), SdpError> {
        let max_chunk = self.config.max_read_chunk as u64;
        let Some(rx) = inner.rx_sa.as_ref() else {
            return Ok(());
        };
        let len = rx.remote.size().min(max_chunk);
        let Some(remote) = rx.remote.first(len) else {
            return Ok(());
        };
        let sink = self
            .fabric
            .register_region(Bytes::from(vec![0u8; len as usize]), AccessFlags::LOCAL_WRITE)?;
        inner.read_seq = inner.read_seq.wrapping_add(1);
        let seq = inner.read_seq;
        let wr = ReadWr {
            wr_id: WrId::new(OpTag::RdmaRead, seq).raw(),
            remote,
            local: sink,
        };
        if let Err(e) = self.fabric.post_remote_read(self.ep, wr) {
            if let Err(re) = self.fabric.release_region(&sink) {
                debug!(ep = %self.ep, error = %re, "release of read sink failed");
            }
            return Err(e.into());
        }
        if let Some(rx) = inner.rx_sa.as_mut() {
            trace!(ep = %self.ep, mseq = rx.mseq, seq, len, "remote read posted");
            rx.state = RxReadState::ReadInflight {
                sink,
                len: len as usize,
                seq,
            };
        }
        Ok(())
    }

    /// Read exactly `n` bytes. End of stream before that is a reset.
    pub(crate) async fn recv_exact(&self, n: usize) -> Result<Bytes, SdpError> {
        let mut buf = BytesMut::with_capacity(n);
        while buf.len() < n {
            let chunk = self.recv(n - buf.len()).await?;
            if chunk.is_empty() {
                return Err(SdpError::ConnectionReset);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Take the pending urgent byte, if any.
    pub(crate) fn recv_urgent(&self) -> Result<u8, SdpError> {
        let mut inner = self.inner.lock();
        self.poll_locked(&mut inner);
        match inner.urgent.take() {
            Some(b) => Ok(b),
            None => Err(SdpError::WouldBlock),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::{connection, device};

    #[tokio::test]
    async fn test_recv_splits_and_drains() {
        let dev = device();
        let conn = connection(&dev, TcpState::CloseWait);
        {
            let mut inner = conn.inner.lock();
            inner.peer_closed = true;
            inner.rx_queue.push_back(RxItem::Data(Bytes::from_static(b"hello")));
            inner.rx_queue.push_back(RxItem::Data(Bytes::from_static(b"world")));
            inner.rx_bytes_queued = 10;
        }
        assert_eq!(conn.recv(3).await.unwrap(), Bytes::from_static(b"hel"));
        assert_eq!(conn.recv(100).await.unwrap(), Bytes::from_static(b"lo"));
        assert_eq!(conn.recv(100).await.unwrap(), Bytes::from_static(b"world"));
        assert_eq!(conn.inner.lock().rx_bytes_queued, 0);
        // End of stream.
        assert!(conn.recv(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recv_exact_eof_is_reset() {
        let dev = device();
        let conn = connection(&dev, TcpState::CloseWait);
        {
            let mut inner = conn.inner.lock();
            inner.peer_closed = true;
            inner.rx_queue.push_back(RxItem::Data(Bytes::from_static(b"abc")));
            inner.rx_bytes_queued = 3;
        }
        assert_eq!(conn.recv_exact(4).await, Err(SdpError::ConnectionReset));
    }

    #[tokio::test]
    async fn test_nonblocking_recv() {
        let dev = device();
        let conn = connection(&dev, TcpState::Established);
        conn.set_nonblocking(true);
        assert_eq!(conn.recv(10).await, Err(SdpError::WouldBlock));
        assert_eq!(conn.recv(0).await, Ok(Bytes::new()));
    }

    #[tokio::test]
    async fn test_orphan_marker_is_skipped() {
        let dev = device();
        let conn = connection(&dev, TcpState::CloseWait);
        {
            let mut inner = conn.inner.lock();
            inner.peer_closed = true;
            inner.rx_queue.push_back(RxItem::Advert(7));
            inner.rx_queue.push_back(RxItem::Data(Bytes::from_static(b"z")));
            inner.rx_bytes_queued = 1;
        }
        assert_eq!(conn.recv(10).await.unwrap(), Bytes::from_static(b"z"));
    }

    #[tokio::test]
    async fn test_recv_urgent() {
        let dev = device();
        let conn = connection(&dev, TcpState::Established);
        assert_eq!(conn.recv_urgent(), Err(SdpError::WouldBlock));
        conn.inner.lock().urgent = Some(b'!');
        assert_eq!(conn.recv_urgent(), Ok(b'!'));
        assert_eq!(conn.recv_urgent(), Err(SdpError::WouldBlock));
    }
}
