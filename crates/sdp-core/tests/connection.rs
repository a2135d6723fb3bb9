mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{eventually, Harness};
use sdp_core::{SdpConfig, SdpError, SendFlags, TcpState};

#[tokio::test]
async fn test_handshake_exchanges_credits() {
    let server_cfg = SdpConfig {
        rx_ring_size: 32,
        ..Default::default()
    };
    let h = Harness::with_configs(server_cfg, SdpConfig::default());
    let (_listener, client, server) = h.pair().await;

    assert_eq!(client.state(), TcpState::Established);
    assert_eq!(server.state(), TcpState::Established);
    assert_eq!(client.peer_addr(), server.local_addr());
    assert_eq!(server.peer_addr(), client.local_addr());

    let c = client.stats();
    let s = server.stats();
    assert_eq!(c.tx_credits, 32);
    assert_eq!(c.remote_credits, 64);
    assert_eq!(s.tx_credits, 64);
    assert_eq!(s.remote_credits, 32);
    assert_eq!(c.credit_updates + s.credit_updates, 0);
}

#[tokio::test]
async fn test_connect_without_listener_refused() {
    let h = Harness::new();
    let err = h
        .client
        .connect("10.0.0.1:9999".parse().unwrap())
        .await
        .unwrap_err();
    assert_eq!(err, SdpError::ConnectionRefused);
    eventually(|| h.client_dev.live_endpoints() == 0).await;
}

#[tokio::test]
async fn test_full_backlog_refuses() {
    let h = Harness::new();
    let listener = h.listen(1);
    let addr = listener.local_addr();

    // Established but never accepted: it holds the only backlog slot.
    let first = h.client.connect(addr).await.unwrap();
    assert_eq!(first.state(), TcpState::Established);

    let second = h.client.connect(addr).await;
    assert_eq!(second.unwrap_err(), SdpError::ConnectionRefused);

    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.peer_addr(), first.local_addr());
}

#[tokio::test]
async fn test_graceful_close_both_sides() {
    let h = Harness::new();
    let (_listener, client, server) = h.pair().await;
    let client_ep = client.endpoint();
    let server_ep = server.endpoint();

    client.send(Bytes::from_static(b"hello")).await.unwrap();
    client.close();

    assert_eq!(&server.recv_exact(5).await.unwrap()[..], b"hello");
    assert!(server.recv(64).await.unwrap().is_empty());
    assert_eq!(server.state(), TcpState::CloseWait);

    server.close();
    eventually(|| client.state() == TcpState::Close && server.state() == TcpState::Close).await;
    eventually(|| h.client_dev.live_endpoints() == 0).await;
    // Only the listener is left on the server.
    eventually(|| h.server_dev.live_endpoints() == 1).await;
    assert_eq!(h.client_dev.disconnect_calls(client_ep), 1);
    assert_eq!(h.server_dev.disconnect_calls(server_ep), 1);
    assert_eq!(h.client_dev.live_mappings(), 0);
    assert_eq!(h.server_dev.live_mappings(), 0);
    assert_eq!(h.client_dev.unknown_unmaps() + h.server_dev.unknown_unmaps(), 0);
}

#[tokio::test]
async fn test_disconn_waits_for_send_completions() {
    let h = Harness::new();
    let (_listener, client, server) = h.pair().await;
    client.set_nodelay(true);

    h.client_dev.hold_send_completions(true);
    for chunk in [&b"ab"[..], b"cd", b"ef"] {
        client.send(Bytes::copy_from_slice(chunk)).await.unwrap();
    }
    client.shutdown_write();
    assert_eq!(client.state(), TcpState::FinWait1);
    assert_eq!(client.stats().tx_outstanding, 3);

    assert_eq!(&server.recv_exact(6).await.unwrap()[..], b"abcdef");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(server.state(), TcpState::Established);

    h.client_dev.release_send_completions();
    eventually(|| server.state() == TcpState::CloseWait).await;
    assert!(server.recv(16).await.unwrap().is_empty());

    // The half-closed side still reads.
    server.send(Bytes::from_static(b"bye")).await.unwrap();
    assert_eq!(&client.recv_exact(3).await.unwrap()[..], b"bye");
}

#[tokio::test]
async fn test_fin_wait_guard_forces_time_wait() {
    let client_cfg = SdpConfig {
        fin_wait_timeout_ms: 50,
        ..Default::default()
    };
    let h = Harness::with_configs(SdpConfig::default(), client_cfg);
    let (_listener, client, server) = h.pair().await;
    let ep = client.endpoint();

    // The peer never sees our DISCONN.
    h.net.hold_delivery(true);
    client.shutdown_write();
    assert_eq!(client.state(), TcpState::FinWait1);

    eventually(|| client.state() == TcpState::Close).await;
    eventually(|| h.client_dev.live_endpoints() == 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.client_dev.disconnect_calls(ep), 1);

    // The fabric disconnect reached the server as a reset.
    assert_eq!(server.recv(16).await, Err(SdpError::ConnectionReset));
    h.net.release_delivery();
}

#[tokio::test]
async fn test_urgent_byte_out_of_band() {
    let h = Harness::new();
    let (_listener, client, server) = h.pair().await;
    client.set_nodelay(true);

    assert_eq!(server.recv_urgent(), Err(SdpError::WouldBlock));
    client
        .send_with(Bytes::from_static(b"abc!"), SendFlags::URGENT)
        .await
        .unwrap();
    assert_eq!(&server.recv_exact(3).await.unwrap()[..], b"abc");
    assert_eq!(server.recv_urgent(), Ok(b'!'));
    assert_eq!(server.recv_urgent(), Err(SdpError::WouldBlock));
}

#[tokio::test]
async fn test_interrupt_blocked_recv() {
    let h = Harness::new();
    let (_listener, client, server) = h.pair().await;
    let server = Arc::new(server);

    let reader = {
        let server = server.clone();
        tokio::spawn(async move { server.recv(16).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.interrupt();
    assert_eq!(reader.await.unwrap(), Err(SdpError::Interrupted));

    // The socket is still usable afterwards.
    client.set_nodelay(true);
    client.send(Bytes::from_static(b"ok")).await.unwrap();
    assert_eq!(&server.recv_exact(2).await.unwrap()[..], b"ok");
}

#[tokio::test]
async fn test_nonblocking_recv() {
    let h = Harness::new();
    let (_listener, _client, server) = h.pair().await;
    server.set_nonblocking(true);
    assert_eq!(server.recv(16).await, Err(SdpError::WouldBlock));
}

#[tokio::test]
async fn test_peer_abort_resets() {
    let h = Harness::new();
    let (_listener, client, server) = h.pair().await;
    client.abort();
    assert_eq!(client.state(), TcpState::Close);
    assert_eq!(server.recv(16).await, Err(SdpError::ConnectionReset));
    assert_eq!(
        client.send(Bytes::from_static(b"x")).await,
        Err(SdpError::ConnectionReset)
    );
}

#[tokio::test]
async fn test_device_removal_resets_everything() {
    let h = Harness::new();
    let (listener, client, server) = h.pair().await;

    h.server_dev.remove();

    assert_eq!(server.recv(16).await, Err(SdpError::ConnectionReset));
    assert!(matches!(listener.accept().await, Err(SdpError::NotConnected)));
    assert!(listener.is_closed());
    assert_eq!(client.recv(16).await, Err(SdpError::ConnectionReset));
    eventually(|| h.server_dev.live_endpoints() == 0).await;
}

#[tokio::test]
async fn test_stack_shutdown_aborts_sockets() {
    let h = Harness::new();
    let (_listener, client, server) = h.pair().await;
    assert_eq!(h.client.socket_count(), 1);

    h.client.shutdown().await;
    assert_eq!(client.state(), TcpState::Close);
    assert_eq!(server.recv(16).await, Err(SdpError::ConnectionReset));
    assert!(matches!(
        h.client.connect(server.local_addr()).await,
        Err(SdpError::Shutdown)
    ));
}

#[tokio::test]
async fn test_interrupt_moderation_programmed() {
    let server_cfg = SdpConfig {
        poll_interval_ms: 5,
        moderation_sample_ms: 10,
        ..Default::default()
    };
    let h = Harness::with_configs(server_cfg, SdpConfig::default());
    let (_listener, client, server) = h.pair().await;
    client.send(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(&server.recv_exact(4).await.unwrap()[..], b"ping");

    let ep = server.endpoint();
    eventually(|| h.server_dev.moderation(ep).is_some()).await;
    let (count, usec) = h.server_dev.moderation(ep).unwrap();
    assert_eq!(count, 16);
    assert_eq!(usec, 0);
}
