//! Connection-manager events and the HELLO / HELLO_ACK handshake.

use std::sync::Weak;

use bytes::Bytes;
use parking_lot::MutexGuard;
use sdp_proto::{Hello, HelloAck, SDP_PROTOCOL_VERSION};
use sdp_verbs::CmEvent;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::conn::{ConnInner, Connection, Role};
use crate::error::SdpError;
use crate::listener::ListenState;
use crate::resize::compute_grant;
use crate::state::TcpState;

/// Receive depth as carried in a header's 16-bit `bufs` field.
fn advertised_bufs(inner: &ConnInner) -> u16 {
    inner.rx_ring.outstanding().min(u16::MAX as u32) as u16
}

impl Connection {
    pub(crate) fn handle_cm_event(&self, event: CmEvent) {
        let mut inner = self.inner.lock();
        debug!(ep = %self.ep, event = event.name(), state = %inner.state, "cm event");
        match event {
            CmEvent::AddrResolved => {
                if let Err(e) = self.fabric.resolve_route(self.ep) {
                    warn!(ep = %self.ep, error = %e, "route resolution failed to start");
                    self.fail(&mut inner, SdpError::ConnectionReset);
                }
            }
            CmEvent::RouteResolved => {
                if let Err(e) = self.start_connect(&mut inner) {
                    warn!(ep = %self.ep, error = %e, "connect failed to start");
                    self.fail(&mut inner, SdpError::ConnectionReset);
                }
            }
            CmEvent::Established { private_data } => self.on_established(inner, private_data),
            CmEvent::AddrError
            | CmEvent::RouteError
            | CmEvent::ConnectError
            | CmEvent::Unreachable => {
                if inner.state.is_synchronizing() {
                    self.fail(&mut inner, SdpError::ConnectionReset);
                }
            }
            CmEvent::Rejected => {
                if inner.state.is_synchronizing() {
                    self.fail(&mut inner, SdpError::ConnectionRefused);
                }
            }
            CmEvent::Disconnected => match inner.state {
                TcpState::FinWait1 | TcpState::LastAck => self.enter_time_wait(&mut inner),
                TcpState::Established
                | TcpState::CloseWait
                | TcpState::SynRecv
                | TcpState::SynSent => self.fail(&mut inner, SdpError::ConnectionReset),
                _ => {}
            },
            CmEvent::TimewaitExit => {
                self.set_state(&mut inner, TcpState::Close);
                drop(inner);
                self.notify.notify_waiters();
                self.destroy();
            }
            CmEvent::DeviceRemoval => {
                warn!(ep = %self.ep, "device removed");
                self.fail(&mut inner, SdpError::ConnectionReset);
            }
            CmEvent::ConnectRequest { .. } => {
                warn!(ep = %self.ep, "connect request on a connection endpoint");
            }
        }
    }

    /// Route resolved: create the queue pair, post receives and send HELLO.
    fn start_connect(&self, inner: &mut ConnInner) -> Result<(), SdpError> {
        if inner.state != TcpState::SynSent {
            return Err(SdpError::NotConnected);
        }
        self.fabric
            .create_qp(self.ep, self.config.qp_caps(self.fabric.device()))?;
        self.post_recvs(inner)?;
        let rcv_size = inner.recv_frags * self.config.frag_size;
        let hello = Hello {
            bufs: advertised_bufs(inner),
            version: SDP_PROTOCOL_VERSION,
            capabilities: self.local_caps(),
            max_adverts: 1,
            local_rcv_size: rcv_size,
            desired_remote_rcv_size: rcv_size,
        };
        debug!(ep = %self.ep, bufs = hello.bufs, rcv_size, "sending HELLO");
        self.fabric.connect(self.ep, hello.encode())?;
        Ok(())
    }

    fn on_established(&self, mut inner: MutexGuard<'_, ConnInner>, private_data: Option<Bytes>) {
        match self.role {
            Role::Active => {
                if inner.state != TcpState::SynSent {
                    warn!(ep = %self.ep, state = %inner.state, "unexpected ESTABLISHED");
                    return;
                }
                let ack = match private_data.as_deref().map(HelloAck::decode) {
                    Some(Ok(ack)) => ack,
                    Some(Err(e)) => {
                        warn!(ep = %self.ep, error = %e, "bad HELLO_ACK");
                        self.fail(&mut inner, SdpError::ConnectionReset);
                        return;
                    }
                    None => {
                        warn!(ep = %self.ep, "ESTABLISHED without HELLO_ACK");
                        self.fail(&mut inner, SdpError::ConnectionReset);
                        return;
                    }
                };
                self.init_peer(&mut inner, ack.bufs, ack.actual_rcv_size, ack.capabilities);
                self.set_state(&mut inner, TcpState::Established);
                self.poll_locked(&mut inner);
                self.drive(&mut inner);
                info!(
                    ep = %self.ep,
                    peer = ?self.peer_addr(),
                    credits = inner.credits.tx_credits,
                    goal = inner.xmit_size_goal,
                    "connected"
                );
                drop(inner);
                self.notify.notify_waiters();
            }
            Role::Passive => {
                if inner.state != TcpState::SynRecv {
                    warn!(ep = %self.ep, state = %inner.state, "unexpected ESTABLISHED");
                    return;
                }
                self.set_state(&mut inner, TcpState::Established);
                self.poll_locked(&mut inner);
                self.drive(&mut inner);
                let listener = inner.listener.as_ref().and_then(Weak::upgrade);
                drop(inner);
                self.notify.notify_waiters();
                match (listener, self.arc()) {
                    (Some(ls), Some(me)) => ls.on_established(me),
                    _ => {
                        debug!(ep = %self.ep, "listener gone, aborting accepted connection");
                        self.abort();
                    }
                }
            }
        }
    }

    /// Passive side: size receive buffers from the peer's HELLO, post them
    /// and answer with HELLO_ACK.
    pub(crate) fn accept_hello(
        &self,
        hello: &Hello,
        listener: Weak<ListenState>,
    ) -> Result<(), SdpError> {
        let mut inner = self.inner.lock();
        inner.listener = Some(listener);
        let device = self.fabric.device();
        inner.recv_frags = compute_grant(
            hello.desired_remote_rcv_size,
            inner.recv_frags,
            self.config.frag_size,
            device.caps.max_recv_sge,
            self.config.rcvbuf,
        );
        self.fabric.create_qp(self.ep, self.config.qp_caps(device))?;
        self.post_recvs(&mut inner)?;
        self.init_peer(
            &mut inner,
            hello.bufs,
            hello.local_rcv_size,
            hello.capabilities,
        );
        let ack = HelloAck {
            bufs: advertised_bufs(&inner),
            version: SDP_PROTOCOL_VERSION,
            capabilities: self.local_caps(),
            max_adverts: 1,
            actual_rcv_size: inner.recv_frags * self.config.frag_size,
        };
        debug!(
            ep = %self.ep,
            bufs = ack.bufs,
            rcv_size = ack.actual_rcv_size,
            "sending HELLO_ACK"
        );
        self.fabric.accept(self.ep, ack.encode())?;
        Ok(())
    }

    /// Wait for the active handshake to finish. A timeout or interrupt
    /// abandons the attempt.
    pub(crate) async fn wait_connected(&self, deadline: Instant) -> Result<(), SdpError> {
        let res = self
            .wait_for(Some(deadline), true, |inner| {
                if let Some(e) = &inner.error {
                    return Some(Err(e.clone()));
                }
                match inner.state {
                    TcpState::SynSent => None,
                    TcpState::Established | TcpState::CloseWait => Some(Ok(())),
                    _ => Some(Err(SdpError::ConnectionReset)),
                }
            })
            .await;
        match res {
            Ok(r) => r,
            Err(w) => {
                let err = SdpError::from(w);
                debug!(ep = %self.ep, error = %err, "connect abandoned");
                self.reset(err.clone());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::{connection, device, eventually};
    use std::time::Duration;

    #[tokio::test]
    async fn test_rejected_is_refused() {
        let dev = device();
        let conn = connection(&dev, TcpState::SynSent);
        conn.handle_cm_event(CmEvent::Rejected);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            conn.wait_connected(deadline).await,
            Err(SdpError::ConnectionRefused)
        );
        eventually(|| conn.is_destroyed()).await;
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let dev = device();
        let conn = connection(&dev, TcpState::SynSent);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(conn.wait_connected(deadline).await, Err(SdpError::TimedOut));
        assert_eq!(conn.inner.lock().error, Some(SdpError::TimedOut));
    }

    #[tokio::test]
    async fn test_disconnected_while_established_resets() {
        let dev = device();
        let conn = connection(&dev, TcpState::Established);
        conn.handle_cm_event(CmEvent::Disconnected);
        let inner = conn.inner.lock();
        assert_eq!(inner.state, TcpState::Close);
        assert_eq!(inner.error, Some(SdpError::ConnectionReset));
    }

    #[tokio::test]
    async fn test_disconnected_while_closing_enters_time_wait() {
        let dev = device();
        let conn = connection(&dev, TcpState::LastAck);
        conn.handle_cm_event(CmEvent::Disconnected);
        assert_eq!(conn.state(), TcpState::TimeWait);
        assert!(conn.inner.lock().error.is_none());
        conn.handle_cm_event(CmEvent::TimewaitExit);
        assert!(conn.is_destroyed());
        assert_eq!(dev.live_endpoints(), 0);
        assert_eq!(dev.disconnect_calls(conn.ep), 1);
    }

    #[tokio::test]
    async fn test_established_without_hello_ack_fails() {
        let dev = device();
        let conn = connection(&dev, TcpState::SynSent);
        conn.handle_cm_event(CmEvent::Established { private_data: None });
        assert_eq!(conn.inner.lock().error, Some(SdpError::ConnectionReset));
    }
}
