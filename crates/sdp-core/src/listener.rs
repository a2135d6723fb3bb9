//! Listening endpoints and their accept queues.
//!
//! A connect request creates a child connection in SYN_RECV that is held in
//! the backlog until the handshake completes, then moves to the accept
//! queue. The backlog limit covers both.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use sdp_verbs::{EndpointId, Fabric};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::conn::Connection;
use crate::error::SdpError;
use crate::registry::SocketRegistry;

#[derive(Default)]
struct ListenInner {
    /// Children still handshaking.
    backlog: Vec<Arc<Connection>>,
    /// Established children not yet accepted.
    accept_queue: VecDeque<Arc<Connection>>,
    closed: bool,
}

pub(crate) struct ListenState {
    pub(crate) ep: EndpointId,
    pub(crate) local_addr: SocketAddr,
    backlog_limit: usize,
    fabric: Arc<dyn Fabric>,
    registry: Arc<SocketRegistry>,
    inner: Mutex<ListenInner>,
    notify: Notify,
}

impl ListenState {
    pub(crate) fn new(
        ep: EndpointId,
        local_addr: SocketAddr,
        backlog_limit: usize,
        fabric: Arc<dyn Fabric>,
        registry: Arc<SocketRegistry>,
    ) -> Self {
        Self {
            ep,
            local_addr,
            backlog_limit: backlog_limit.max(1),
            fabric,
            registry,
            inner: Mutex::new(ListenInner::default()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn has_room(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed && inner.backlog.len() + inner.accept_queue.len() < self.backlog_limit
    }

    /// Track a child whose handshake is in progress. Fails once the
    /// listener is closed or full.
    pub(crate) fn add_pending(&self, conn: Arc<Connection>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed || inner.backlog.len() + inner.accept_queue.len() >= self.backlog_limit {
            return false;
        }
        inner.backlog.push(conn);
        true
    }

    /// The child's handshake finished: make it acceptable.
    pub(crate) fn on_established(&self, conn: Arc<Connection>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            conn.abort();
            return;
        }
        inner.backlog.retain(|c| c.ep != conn.ep);
        debug!(listener = %self.ep, ep = %conn.ep, "connection ready to accept");
        inner.accept_queue.push_back(conn);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Forget a child that was torn down before being accepted.
    pub(crate) fn remove(&self, ep: EndpointId) {
        let mut inner = self.inner.lock();
        inner.backlog.retain(|c| c.ep != ep);
        inner.accept_queue.retain(|c| c.ep != ep);
    }

    pub(crate) async fn accept(&self) -> Result<Arc<Connection>, SdpError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(SdpError::NotConnected);
                }
                if let Some(conn) = inner.accept_queue.pop_front() {
                    return Ok(conn);
                }
            }
            notified.await;
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Stop listening. Children not yet accepted are reset.
    pub(crate) fn close(&self) {
        let (backlog, queued) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                std::mem::take(&mut inner.backlog),
                std::mem::take(&mut inner.accept_queue),
            )
        };
        self.registry.remove(self.ep);
        self.fabric.destroy_endpoint(self.ep);
        for conn in backlog {
            conn.reset(SdpError::ConnectionReset);
        }
        for conn in queued {
            conn.abort();
        }
        self.notify.notify_waiters();
        info!(listener = %self.ep, addr = %self.local_addr, "listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::{connection, device};
    use crate::state::TcpState;

    fn listen_state(dev: &Arc<sdp_verbs::LoopbackDevice>, limit: usize) -> Arc<ListenState> {
        let ep = dev.create_endpoint().unwrap();
        let addr = dev.listen(ep, "10.0.0.1:7000".parse().unwrap()).unwrap();
        Arc::new(ListenState::new(
            ep,
            addr,
            limit,
            dev.clone(),
            Arc::new(SocketRegistry::new()),
        ))
    }

    #[tokio::test]
    async fn test_backlog_limit() {
        let dev = device();
        let ls = listen_state(&dev, 2);
        assert!(ls.add_pending(connection(&dev, TcpState::SynRecv)));
        assert!(ls.add_pending(connection(&dev, TcpState::SynRecv)));
        assert!(!ls.has_room());
        assert!(!ls.add_pending(connection(&dev, TcpState::SynRecv)));
    }

    #[tokio::test]
    async fn test_accept_after_established() {
        let dev = device();
        let ls = listen_state(&dev, 4);
        let child = connection(&dev, TcpState::SynRecv);
        assert!(ls.add_pending(child.clone()));
        let l = ls.clone();
        let accepted = tokio::spawn(async move { l.accept().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        ls.on_established(child.clone());
        let got = accepted.await.unwrap().unwrap();
        assert_eq!(got.ep, child.ep);
        assert!(ls.has_room());
    }

    #[tokio::test]
    async fn test_close_resets_children() {
        let dev = device();
        let ls = listen_state(&dev, 4);
        let child = connection(&dev, TcpState::SynRecv);
        assert!(ls.add_pending(child.clone()));
        ls.close();
        assert!(ls.is_closed());
        assert_eq!(child.inner.lock().error, Some(SdpError::ConnectionReset));
        assert!(matches!(ls.accept().await, Err(SdpError::NotConnected)));
        assert!(!ls.add_pending(connection(&dev, TcpState::SynRecv)));
    }
}
