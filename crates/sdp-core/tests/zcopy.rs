mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{eventually, random_payload, Harness};
use sdp_core::SdpConfig;
use sdp_verbs::DeviceCaps;

const LEN: usize = 600_000;

#[tokio::test]
async fn test_large_send_pulled_by_remote_read() {
    let h = Harness::new();
    let (_listener, client, server) = h.pair().await;
    let data = random_payload(LEN);

    let reader = tokio::spawn(async move {
        let got = server.recv_exact(LEN).await.unwrap();
        (server, got)
    });
    assert_eq!(client.send(Bytes::from(data.clone())).await.unwrap(), LEN);
    let (server, got) = reader.await.unwrap();
    assert_eq!(&got[..], &data[..]);

    let inline = client.stats().xmit_size_goal - 16;
    assert_eq!(client.stats().zcopy_sends, 1);
    assert_eq!(server.stats().rdma_read_bytes, (LEN - inline) as u64);
    eventually(|| h.client_dev.live_regions() == 0 && h.server_dev.live_regions() == 0).await;
    assert_eq!(h.client_dev.unknown_releases() + h.server_dev.unknown_releases(), 0);
}

#[tokio::test]
async fn test_small_reads_chunk_the_remote_read() {
    let server_cfg = SdpConfig {
        max_read_chunk: 4096,
        ..Default::default()
    };
    let h = Harness::with_configs(server_cfg, SdpConfig::default());
    let (_listener, client, server) = h.pair().await;
    let data = random_payload(200_000);
    let expected = data.clone();

    let reader = tokio::spawn(async move {
        let mut got = Vec::new();
        while got.len() < expected.len() {
            let chunk = server.recv(1000).await.unwrap();
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= 1000);
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, expected);
    });
    client.send(Bytes::from(data)).await.unwrap();
    reader.await.unwrap();
    assert_eq!(client.stats().zcopy_sends, 1);
}

#[tokio::test]
async fn test_no_remote_read_without_device_support() {
    let caps = DeviceCaps {
        remote_read: false,
        ..Default::default()
    };
    let h = Harness::with(
        caps,
        DeviceCaps::default(),
        SdpConfig::default(),
        SdpConfig::default(),
    );
    let (_listener, client, server) = h.pair().await;
    let data = random_payload(LEN);

    let reader = tokio::spawn(async move { server.recv_exact(LEN).await.unwrap() });
    client.send(Bytes::from(data.clone())).await.unwrap();
    assert_eq!(&reader.await.unwrap()[..], &data[..]);
    assert_eq!(client.stats().zcopy_sends, 0);
    assert_eq!(h.client_dev.live_regions(), 0);
}

#[tokio::test]
async fn test_late_cancel_response_is_ignored() {
    let client_cfg = SdpConfig {
        zcopy_adv_timeout_ms: 30,
        zcopy_cancel_timeout_ms: 30,
        ..Default::default()
    };
    let h = Harness::with_configs(SdpConfig::default(), client_cfg);
    let (_listener, client, server) = h.pair().await;
    let data = random_payload(LEN);

    // The advertisement and its cancel both sit in the network until the
    // sender has given up and copied the rest.
    h.net.hold_delivery(true);
    client.send(Bytes::from(data.clone())).await.unwrap();
    let c = client.stats();
    assert_eq!(c.zcopy_cancels, 1);
    assert_eq!(c.zcopy_sends, 0);
    assert_eq!(h.client_dev.live_regions(), 0);

    h.net.release_delivery();
    let got = server.recv_exact(LEN).await.unwrap();
    assert_eq!(&got[..], &data[..]);

    eventually(|| client.stats().stale_zcopy_responses == 1).await;
    assert_eq!(server.stats().rdma_read_bytes, 0);
    assert_eq!(h.client_dev.unknown_releases() + h.server_dev.unknown_releases(), 0);
    assert_eq!(h.server_dev.live_regions(), 0);

    // The stream keeps working after the stale response.
    client.send(Bytes::from_static(b"tail")).await.unwrap();
    assert_eq!(&server.recv_exact(4).await.unwrap()[..], b"tail");
}

#[tokio::test]
async fn test_crossing_offers_fall_back_to_copy() {
    let h = Harness::new();
    let (_listener, client, server) = h.pair().await;
    let client = Arc::new(client);
    let server = Arc::new(server);
    let a = random_payload(LEN);
    let b = random_payload(LEN);

    let (sent_a, sent_b) = tokio::join!(
        client.send(Bytes::from(a.clone())),
        server.send(Bytes::from(b.clone())),
    );
    assert_eq!(sent_a.unwrap(), LEN);
    assert_eq!(sent_b.unwrap(), LEN);

    let (got_a, got_b) = tokio::join!(server.recv_exact(LEN), client.recv_exact(LEN));
    assert_eq!(&got_a.unwrap()[..], &a[..]);
    assert_eq!(&got_b.unwrap()[..], &b[..]);

    let c = client.stats();
    let s = server.stats();
    assert_eq!(c.zcopy_sends + s.zcopy_sends, 0);
    // The connecting side withdraws its own offer.
    assert_eq!(c.zcopy_cancels, 1);
    assert_eq!(s.zcopy_cancels, 0);
    assert_eq!(s.zcopy_fallbacks, 1);
    assert_eq!(c.rdma_read_bytes + s.rdma_read_bytes, 0);
    eventually(|| h.client_dev.live_regions() == 0 && h.server_dev.live_regions() == 0).await;
}
